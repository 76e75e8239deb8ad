//! Building blocks for the custodial ATM toolchain.
//!
//! The crate is split along the trust boundary of the system:
//!
//! * [`ledger`] — the authoritative account record: one balance, one owner,
//!   and the admission rules for deposits, withdrawals, and owner handoff.
//! * [`chain`] — the single-node execution environment that hosts the
//!   deployed record, serializes mutating calls, and issues signed receipts.
//! * [`wallet`] — the key-holding side: the provider capability interface
//!   and a directory-backed keystore implementation.
//! * [`session`] — the client controller that binds a wallet identity to the
//!   deployed contract and keeps its view caches consistent.
//! * [`config`] — state-directory layout, timeouts, and defaults.
//!
//! The modules are intentionally small so the CLI (and tests) can combine
//! them without bespoke plumbing in each consumer.

pub mod chain;
pub mod config;
pub mod ledger;
pub mod session;
pub mod wallet;

pub use chain::{AtmHandle, ChainError, Node, SignedReceipt};
pub use ledger::{Address, Amount, AtmLedger, LedgerError, LedgerEvent};
pub use session::{Session, SessionError};
pub use wallet::{KeystoreWallet, WalletError, WalletProvider};
