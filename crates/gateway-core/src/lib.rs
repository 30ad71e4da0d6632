//! # gateway-core
//!
//! Fuel token mint, replay history and pending-claim mailbox.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  mint/spend  ┌──────────────┐
//! │     Mint     │─────────────▶│   History    │  Repository<HistoryRecord>
//! │ (FuelToken)  │              │ (replay log) │
//! └──────────────┘              └──────▲───────┘
//!                                      │ already claimed?
//! ┌──────────────┐  publish/claim      │
//! │   Mailbox    │─────────────────────┘
//! │              │─────────────▶ Repository<String> (pending claims)
//! └──────────────┘
//! ```
//!
//! Storage is injected through [`Repository`], so tests run on
//! [`MemoryStore`] and the server on [`JsonFileStore`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_core::{DepositId, MemoryStore, Mint};
//!
//! let mint = Mint::new(secret, "https://gateway.example", Arc::new(MemoryStore::new()))?;
//! let token = mint.mint(1000, &DepositId::new("0xdeadbeef")?)?;
//!
//! let spend = mint.spend(&token, 5)?;
//! // spend.token carries balance = 995
//! ```

pub mod error;
pub mod mailbox;
pub mod mint;
pub mod store;
pub mod token;

pub use error::{MintError, Result};
pub use mailbox::{Claim, Mailbox};
pub use mint::{DepositId, HistoryRecord, Inspection, MAX_DEPOSIT_ID_LEN, Mint, Spend, TokenStatus};
pub use store::{JsonFileStore, MemoryStore, Repository};
pub use token::{FuelToken, TokenKey};
