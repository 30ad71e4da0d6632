//! Token Mint
//!
//! Issues fuel tokens for confirmed deposits and debits them per call.
//!
//! The mint is stateless with respect to live balances: a token carries its
//! own balance, and the history only records which identifiers have been
//! minted from deposits or already spent. Change tokens get a history entry
//! only once they are spent themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{MintError, Result};
use crate::store::Repository;
use crate::token::{CHANGE_PREFIX, FuelToken, TokenKey};

/// Longest accepted deposit identifier, in bytes
pub const MAX_DEPOSIT_ID_LEN: usize = 1024;

/// Deposit identifier (an external transaction hash or similar)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepositId(String);

impl DepositId {
    /// Validate a deposit identifier
    ///
    /// The change-token namespace is reserved so a deposit can never shadow
    /// a spent change identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(MintError::Malformed("deposit id cannot be empty".into()));
        }
        if id.len() > MAX_DEPOSIT_ID_LEN {
            return Err(MintError::Malformed(format!(
                "deposit id exceeds {MAX_DEPOSIT_ID_LEN} bytes"
            )));
        }
        if id.starts_with(CHANGE_PREFIX) {
            return Err(MintError::Malformed(format!(
                "deposit id cannot start with {CHANGE_PREFIX}"
            )));
        }
        Ok(Self(id))
    }

    /// Decode a deposit identifier delivered as raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id = std::str::from_utf8(bytes)
            .map_err(|_| MintError::Malformed("deposit id is not valid UTF-8".into()))?;
        Self::new(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DepositId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a token identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Minted,
    Spent,
}

/// History entry for a token identifier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub status: TokenStatus,

    /// Minted amount, or the balance the token held when it was spent
    pub amount: u64,

    pub time: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn minted(amount: u64) -> Self {
        Self {
            status: TokenStatus::Minted,
            amount,
            time: Utc::now(),
        }
    }

    pub fn spent(prior_balance: u64) -> Self {
        Self {
            status: TokenStatus::Spent,
            amount: prior_balance,
            time: Utc::now(),
        }
    }

    pub fn is_spent(&self) -> bool {
        self.status == TokenStatus::Spent
    }
}

/// Successful spend
#[derive(Clone, Debug)]
pub struct Spend {
    /// Serialized change token carrying the remaining balance
    pub token: String,

    /// Remaining balance
    pub balance: u64,

    /// Identifier of the token that was consumed
    pub spent_id: String,
}

/// Verified view of a token, without spending it
#[derive(Clone, Debug, Serialize)]
pub struct Inspection {
    pub identifier: String,
    pub balance: u64,
    pub spent: bool,
    pub change: bool,
}

/// The token mint
pub struct Mint {
    key: TokenKey,
    location: String,
    history: Arc<dyn Repository<HistoryRecord>>,
}

impl std::fmt::Debug for Mint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mint")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl Mint {
    /// Create a mint signing with `secret` and issuing for `location`
    pub fn new(
        secret: impl AsRef<[u8]>,
        location: impl Into<String>,
        history: Arc<dyn Repository<HistoryRecord>>,
    ) -> Result<Self> {
        Ok(Self {
            key: TokenKey::new(secret)?,
            location: location.into(),
            history,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Shared handle to the replay history
    pub fn history(&self) -> Arc<dyn Repository<HistoryRecord>> {
        Arc::clone(&self.history)
    }

    /// History entry for an identifier, if any
    pub fn status(&self, identifier: &str) -> Result<Option<HistoryRecord>> {
        self.history.get(identifier)
    }

    /// Mint a fresh token for a confirmed deposit
    ///
    /// The first call for a deposit wins; later calls fail with
    /// [`MintError::DuplicateDeposit`]. The history entry is durable before
    /// the token is returned.
    pub fn mint(&self, amount: u64, deposit_id: &DepositId) -> Result<String> {
        let token = FuelToken::issue(&self.key, &self.location, deposit_id.as_str(), amount)?;

        if !self
            .history
            .insert_if_absent(deposit_id.as_str(), HistoryRecord::minted(amount))?
        {
            tracing::warn!(deposit_id = %deposit_id, "Duplicate deposit rejected");
            return Err(MintError::DuplicateDeposit(deposit_id.to_string()));
        }

        tracing::info!(deposit_id = %deposit_id, amount, "Minted fuel token");
        Ok(token.serialize())
    }

    /// Verify a token, debit `cost` and return the change token
    ///
    /// A token whose balance is below `cost` is left unspent.
    pub fn spend(&self, token: &str, cost: u64) -> Result<Spend> {
        let token = FuelToken::deserialize(token)?;
        let id = token.identifier().to_string();
        let balance = token.claimed_balance()?;

        // Replayed tokens are rejected before any HMAC work.
        if self.history.get(&id)?.is_some_and(|r| r.is_spent()) {
            tracing::warn!(token_id = %id, "Replay detected");
            return Err(MintError::ReplayDetected(id));
        }

        if let Err(e) = token.verify(&self.key, &self.location, balance) {
            tracing::warn!(token_id = %id, "Token signature rejected");
            return Err(e);
        }

        if balance < cost {
            tracing::info!(token_id = %id, balance, cost, "Insufficient funds");
            return Err(MintError::InsufficientFunds { balance, cost });
        }

        let remaining = balance - cost;
        let change_id = format!("{CHANGE_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let change = FuelToken::issue(&self.key, &self.location, change_id, remaining)?;

        let marked = self.history.modify(&id, &mut |current| match current {
            Some(record) if record.is_spent() => None,
            _ => Some(HistoryRecord::spent(balance)),
        })?;
        if !marked {
            tracing::warn!(token_id = %id, "Replay detected during spend");
            return Err(MintError::ReplayDetected(id));
        }

        tracing::debug!(token_id = %id, cost, remaining, "Spent fuel token");
        Ok(Spend {
            token: change.serialize(),
            balance: remaining,
            spent_id: id,
        })
    }

    /// Verify a token and report its balance and spent status
    pub fn inspect(&self, token: &str) -> Result<Inspection> {
        let token = FuelToken::deserialize(token)?;
        let balance = token.claimed_balance()?;
        token.verify(&self.key, &self.location, balance)?;

        let spent = self
            .history
            .get(token.identifier())?
            .is_some_and(|r| r.is_spent());

        Ok(Inspection {
            identifier: token.identifier().to_string(),
            balance,
            spent,
            change: token.is_change(),
        })
    }

    /// Burn a token without issuing change; returns the forfeited balance
    pub fn revoke(&self, token: &str) -> Result<u64> {
        let token = FuelToken::deserialize(token)?;
        let balance = token.claimed_balance()?;
        token.verify(&self.key, &self.location, balance)?;

        let id = token.identifier();
        let marked = self.history.modify(id, &mut |current| match current {
            Some(record) if record.is_spent() => None,
            _ => Some(HistoryRecord::spent(balance)),
        })?;
        if !marked {
            return Err(MintError::ReplayDetected(id.to_string()));
        }

        tracing::info!(token_id = %id, balance, "Revoked fuel token");
        Ok(balance)
    }
}
