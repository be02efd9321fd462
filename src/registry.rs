use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::RelayConfig;
use crate::model::{Bid, RoomId};
use crate::room::{self, RoomHandle};

/// Per-room line in a `/stats` snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub auction_id: String,
    pub client_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_bid: Option<Bid>,
}

/// A full `/stats` snapshot. Not a transactional view: each room's fields
/// are read via its atomic counter and published snapshot, not by freezing
/// the room's event loop.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_hubs: usize,
    pub hubs: Vec<RoomStats>,
    pub timestamp: DateTime<Utc>,
}

/// The concurrent index of active rooms. `get`/`stats` take a shared lock;
/// `get_or_create`/`delete`/`cleanup_inactive` take an exclusive lock. No
/// room's internals are touched while holding this lock.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<RoomId, RoomHandle>>>,
    config: RelayConfig,
}

impl RoomRegistry {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Looks up a room without creating one.
    pub async fn get(&self, auction_id: &RoomId) -> Option<RoomHandle> {
        self.rooms.read().await.get(auction_id).cloned()
    }

    /// Returns the existing room, or atomically constructs and starts a new
    /// one if absent.
    pub async fn get_or_create(&self, auction_id: &RoomId) -> RoomHandle {
        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(auction_id) {
            return handle.clone();
        }
        info!(auction_id = %auction_id, "creating room");
        let handle = room::spawn_room(auction_id.clone(), self.config.clone());
        rooms.insert(auction_id.clone(), handle.clone());
        handle
    }

    /// Removes a room from the index and cancels it. Idempotent.
    pub async fn delete(&self, auction_id: &RoomId) {
        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.remove(auction_id) {
            handle.cancel();
        }
    }

    /// Cancels and removes every room with zero members.
    pub async fn cleanup_inactive(&self) {
        let mut rooms = self.rooms.write().await;
        let inactive: Vec<RoomId> = rooms
            .iter()
            .filter(|(_, handle)| handle.member_count() == 0)
            .map(|(id, _)| id.clone())
            .collect();
        for id in inactive {
            if let Some(handle) = rooms.remove(&id) {
                info!(auction_id = %id, "reaping idle room");
                handle.cancel();
            }
        }
    }

    /// A monitoring snapshot of every active room.
    pub async fn stats(&self) -> Stats {
        let rooms = self.rooms.read().await;
        let hubs = rooms
            .iter()
            .map(|(id, handle)| RoomStats {
                auction_id: id.0.clone(),
                client_count: handle.member_count(),
                highest_bid: handle.highest_bid(),
            })
            .collect::<Vec<_>>();
        Stats {
            total_hubs: rooms.len(),
            hubs,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent_across_calls() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let id = RoomId("r1".into());

        let a = registry.get_or_create(&id).await;
        let b = registry.get_or_create(&id).await;

        assert_eq!(a.member_count(), b.member_count());
        a.cancel();
        // Both handles talk to the same underlying room.
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let id = RoomId("r1".into());
        registry.get_or_create(&id).await;

        registry.delete(&id).await;
        registry.delete(&id).await;

        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn get_without_create_returns_none_for_unknown_room() {
        let registry = RoomRegistry::new(RelayConfig::default());
        assert!(registry.get(&RoomId("ghost".into())).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_only_empty_rooms() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let empty = RoomId("empty".into());
        registry.get_or_create(&empty).await;

        registry.cleanup_inactive().await;

        assert!(registry.get(&empty).await.is_none());
    }

    #[tokio::test]
    async fn recreating_after_delete_yields_fresh_room() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let id = RoomId("r1".into());
        let first = registry.get_or_create(&id).await;
        first.bid(crate::model::ClientId("a".into()), 10.0).await;
        registry.delete(&id).await;

        let second = registry.get_or_create(&id).await;
        assert!(second.highest_bid().is_none());
    }
}
