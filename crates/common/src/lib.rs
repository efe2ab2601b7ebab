//! Shared types and errors for wazper crates.

pub mod error;
pub mod types;

pub use {
    error::{BoxError, Error, Result},
    types::{Account, AccountId, AccountStatus, AccountUpdate, ActivityAction},
};
