//! Core of the referral ledger.
//!
//! The crate is split along the lines of the bonus pipeline:
//!
//! * [`model`]: members, relation rows, ledger entries, withdrawals and
//!   notifications as plain serde records.
//! * [`config`]: bonus tables and rank thresholds loaded from TOML.
//! * [`bonus`]: pure bonus calculator (direct, depth and deposit bonuses).
//! * [`rank`]: rank evaluation and the promotion mutations it implies.
//! * [`closure`]: closure-table builder that links a new member to every
//!   ancestor up to the configured depth.
//! * [`store`]: the account store and append-only ledger with batch
//!   (all-or-nothing) mutation and snapshot persistence.
//! * [`engine`]: orchestrates registration, first-qualifying-action and
//!   deposit events on top of the store.
//! * [`tree`]: read-only referral tree for display.
//! * [`notify`]: the notification sink boundary.

pub mod bonus;
pub mod closure;
pub mod config;
pub mod engine;
pub mod model;
pub mod money;
pub mod notify;
pub mod rank;
pub mod store;
pub mod tree;

mod error;

pub use config::BonusConfig;
pub use engine::ReferralEngine;
pub use error::{ErrorKind, ReferralError, Result};
