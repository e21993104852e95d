#![forbid(unsafe_code)]

pub mod access;
pub mod common;
pub mod form;
pub mod submission;
pub mod table;

pub use common::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};
