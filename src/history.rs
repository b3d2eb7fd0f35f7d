//! Append-only status history for an order
//!
//! Each event embeds the digest of the one before it, the order record keeps
//! the digest of the newest, so a rewritten or dropped event shows up in
//! [`verify_chain`].
use super::error::OrderError;
use super::order::OrderStatus;
use super::types::TimeStamp;
use chrono::Utc;

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct StatusEvent {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    pub sequence: u32,
    #[n(2)]
    pub actor_id: String,
    #[n(3)]
    pub from: Option<OrderStatus>, // None for the creation event
    #[n(4)]
    pub to: OrderStatus,
    #[n(5)]
    pub note: Option<String>,
    #[n(6)]
    pub at: TimeStamp<Utc>,
    #[n(7)]
    pub prev_digest: Option<String>,
}

impl StatusEvent {
    pub fn new(
        order_id: String,
        actor_id: String,
        from: Option<OrderStatus>,
        to: OrderStatus,
        note: Option<String>,
    ) -> Self {
        Self {
            order_id,
            sequence: 0,
            actor_id,
            from,
            to,
            note,
            at: TimeStamp::new(),
            prev_digest: None,
        }
    }

    /// Places the event after `prev_digest` at position `sequence`.
    pub fn chained(mut self, sequence: u32, prev_digest: Option<String>) -> Self {
        self.sequence = sequence;
        self.prev_digest = prev_digest;
        self
    }

    pub fn build(&self) -> Result<(String, Vec<u8>), OrderError> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

/// Checks sequence numbers, back links, and that the last digest equals `head`.
pub fn verify_chain(events: &[StatusEvent], head: Option<&str>) -> Result<bool, OrderError> {
    let mut prev: Option<String> = None;
    for (index, event) in events.iter().enumerate() {
        if event.sequence as usize != index || event.prev_digest != prev {
            return Ok(false);
        }
        prev = Some(event.build()?.0);
    }
    Ok(prev.as_deref() == head)
}
