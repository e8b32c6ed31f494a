//! # Control Plane Module
//!
//! Instance lifecycle, prepaid wallets and usage billing.
//!
//! ## Components
//!
//! - `instance`: Instance model and state machine
//! - `wallet`: Wallets, ledger entries, usage records, deposits
//! - `store`: Persistence (in-memory and PostgreSQL)
//! - `lifecycle`: Instance lifecycle orchestration
//! - `billing`: Periodic metering and auto-suspension
//! - `errors`: Control plane errors
//!
//! ## Balance Invariant
//!
//! Every balance change goes through one store primitive that moves the
//! balance and appends the matching ledger entry in the same transaction,
//! so `sum(ledger) == balance` holds for every wallet.

pub mod billing;
pub mod errors;
pub mod instance;
pub mod lifecycle;
pub mod store;
pub mod wallet;

pub use billing::{BillingEngine, BillingScheduler, PassReport};
pub use errors::*;
pub use instance::*;
pub use lifecycle::InstanceLifecycleManager;
pub use store::{MemoryStore, PgStore, Store, StoreError};
pub use wallet::*;
