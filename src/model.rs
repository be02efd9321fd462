use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an auction room, supplied by the client at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId(s)
    }
}

/// Opaque client identifier, supplied by the client at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        ClientId(s)
    }
}

/// The room's highest-bid record. At most one lives in a room at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub sender_id: ClientId,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// The outcome of validating a candidate bid against a room's current state.
#[derive(Debug, Clone, PartialEq)]
pub enum BidOutcome {
    /// Silently dropped: non-positive price. Not shown to the client.
    Dropped,
    /// Rejected with a reason shown only to the sender.
    Rejected { reason: &'static str },
    /// Accepted; becomes the new highest bid.
    Accepted,
}

/// Validates `price` against the room's current highest bid and minimum
/// increment, per the exact ordered rules of the bidding protocol.
pub fn validate_bid(price: f64, highest: Option<&Bid>, min_increment: f64) -> BidOutcome {
    if price <= 0.0 {
        return BidOutcome::Dropped;
    }
    if let Some(highest) = highest {
        if price <= highest.price {
            return BidOutcome::Rejected {
                reason: "Bid must be higher than current highest bid",
            };
        }
        if price < highest.price + min_increment {
            return BidOutcome::Rejected {
                reason: "Bid increment too small",
            };
        }
    }
    BidOutcome::Accepted
}
