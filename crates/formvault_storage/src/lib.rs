#![forbid(unsafe_code)]

pub mod repo;
pub mod store;
pub mod table_manager;
