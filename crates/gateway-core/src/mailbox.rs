//! Pending-Claim Mailbox
//!
//! Hands a freshly minted token to a depositor that polls for it. Entries
//! are popped on claim; the mint history tells a repeat claim apart from a
//! deposit that has not been credited yet.

use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::mint::{DepositId, HistoryRecord};
use crate::store::Repository;

/// Outcome of a claim attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Claim {
    /// Token handed over; the entry is gone
    Claimed { access_token: String },

    /// Deposit not credited yet, keep polling
    NotReady,

    /// Deposit was credited and its token already picked up
    AlreadyClaimed,
}

/// Durable deposit → token handoff
pub struct Mailbox {
    pending: Arc<dyn Repository<String>>,
    history: Arc<dyn Repository<HistoryRecord>>,
}

impl Mailbox {
    pub fn new(
        pending: Arc<dyn Repository<String>>,
        history: Arc<dyn Repository<HistoryRecord>>,
    ) -> Self {
        Self { pending, history }
    }

    /// Store a token for pickup, replacing any pending entry
    pub fn publish(&self, deposit_id: &DepositId, token: &str) -> Result<()> {
        self.pending.upsert(deposit_id.as_str(), token.to_string())?;
        tracing::info!(deposit_id = %deposit_id, "Token stored in mailbox");
        Ok(())
    }

    /// Pop the token for a deposit
    pub fn claim(&self, deposit_id: &str) -> Result<Claim> {
        if let Some(access_token) = self.pending.take(deposit_id)? {
            tracing::info!(deposit_id, "Token claimed from mailbox");
            return Ok(Claim::Claimed { access_token });
        }

        if self.history.contains(deposit_id)? {
            Ok(Claim::AlreadyClaimed)
        } else {
            Ok(Claim::NotReady)
        }
    }

    /// Number of tokens awaiting pickup
    pub fn pending(&self) -> Result<usize> {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mint::Mint;
    use crate::store::MemoryStore;

    fn setup() -> (Mint, Mailbox) {
        let history: Arc<dyn Repository<HistoryRecord>> = Arc::new(MemoryStore::new());
        let mint = Mint::new("secret", "https://gateway.test", Arc::clone(&history)).unwrap();
        let mailbox = Mailbox::new(Arc::new(MemoryStore::new()), history);
        (mint, mailbox)
    }

    #[test]
    fn test_claim_exactly_once() {
        let (mint, mailbox) = setup();
        let deposit = DepositId::new("0xabc").unwrap();

        assert_eq!(mailbox.claim("0xabc").unwrap(), Claim::NotReady);

        let token = mint.mint(500, &deposit).unwrap();
        mailbox.publish(&deposit, &token).unwrap();
        assert_eq!(mailbox.pending().unwrap(), 1);

        assert_eq!(
            mailbox.claim("0xabc").unwrap(),
            Claim::Claimed { access_token: token }
        );
        assert_eq!(mailbox.claim("0xabc").unwrap(), Claim::AlreadyClaimed);
        assert_eq!(mailbox.pending().unwrap(), 0);
    }

    #[test]
    fn test_publish_overwrites() {
        let (_, mailbox) = setup();
        let deposit = DepositId::new("dep").unwrap();

        mailbox.publish(&deposit, "first").unwrap();
        mailbox.publish(&deposit, "second").unwrap();

        assert_eq!(
            mailbox.claim("dep").unwrap(),
            Claim::Claimed { access_token: "second".into() }
        );
    }

    #[test]
    fn test_claim_serializes_with_status_tag() {
        let json = serde_json::to_value(Claim::AlreadyClaimed).unwrap();
        assert_eq!(json["status"], "already_claimed");
    }
}
