use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// The wire envelope's `type` tag. Unrecognized values fail to deserialize,
/// which is how frames outside the enumerated set get rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Auction,
    Bid,
    Error,
    Ping,
    Pong,
}

/// Recognized `action` tags. `action` is otherwise a free-form string on
/// the wire; these constants are the values the server itself produces or
/// dispatches on.
pub mod action {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const PLACE_BID: &str = "place_bid";
    pub const CURRENT_BID: &str = "current_bid";
    pub const BID_REJECTED: &str = "bid_rejected";
}

/// The wire envelope. All fields but `type` and `auction_id` may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<String>,
    pub auction_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bidding_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Builds the `bid / current_bid` frame sent to a joining client.
    pub fn current_bid(auction_id: &str, holder: &str, price: f64, timestamp: DateTime<Utc>) -> Self {
        Message {
            kind: MessageType::Bid,
            action: Some(action::CURRENT_BID.to_string()),
            auction_id: auction_id.to_string(),
            sender_id: Some(holder.to_string()),
            bidding_price: Some(price),
            content: Some("Current highest bid".to_string()),
            timestamp: Some(timestamp),
        }
    }

    /// Builds the `bid / place_bid` broadcast frame for an accepted bid.
    pub fn place_bid(auction_id: &str, sender_id: &str, price: f64, timestamp: DateTime<Utc>) -> Self {
        Message {
            kind: MessageType::Bid,
            action: Some(action::PLACE_BID.to_string()),
            auction_id: auction_id.to_string(),
            sender_id: Some(sender_id.to_string()),
            bidding_price: Some(price),
            content: Some("New highest bid".to_string()),
            timestamp: Some(timestamp),
        }
    }

    /// Builds the `error / bid_rejected` frame sent only to the bidder.
    pub fn bid_rejected(auction_id: &str, sender_id: &str, reason: &str, timestamp: DateTime<Utc>) -> Self {
        Message {
            kind: MessageType::Error,
            action: Some(action::BID_REJECTED.to_string()),
            auction_id: auction_id.to_string(),
            sender_id: Some(sender_id.to_string()),
            bidding_price: None,
            content: Some(reason.to_string()),
            timestamp: Some(timestamp),
        }
    }

    /// Builds the `pong` reply to a client `ping`.
    pub fn pong(auction_id: &str, sender_id: &str, timestamp: DateTime<Utc>) -> Self {
        Message {
            kind: MessageType::Pong,
            action: None,
            auction_id: auction_id.to_string(),
            sender_id: Some(sender_id.to_string()),
            bidding_price: None,
            content: None,
            timestamp: Some(timestamp),
        }
    }
}

/// Encodes a `Message` to its wire representation.
pub fn encode(message: &Message) -> Result<String, DecodeError> {
    serde_json::to_string(message).map_err(|e| DecodeError::new(e.to_string()))
}

/// Decodes a wire frame into a `Message`. Rejects an unrecognized `type`
/// (serde fails the tag match) and out-of-range numeric fields.
pub fn decode(bytes: &str) -> Result<Message, DecodeError> {
    let message: Message =
        serde_json::from_str(bytes).map_err(|e| DecodeError::new(e.to_string()))?;

    if let Some(price) = message.bidding_price {
        if price < 0.0 {
            return Err(DecodeError::new("biddingPrice must be >= 0"));
        }
    }

    Ok(message)
}
