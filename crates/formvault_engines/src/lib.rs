#![forbid(unsafe_code)]

pub mod field_codec;
pub mod payload;
pub mod schema_registry;
