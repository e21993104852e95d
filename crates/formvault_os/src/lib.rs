#![forbid(unsafe_code)]

pub mod access_filter;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod service;
pub mod subform_linker;
