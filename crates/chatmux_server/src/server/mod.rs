#![forbid(unsafe_code)]

pub mod adapter_manager;
pub mod adapters;
pub mod sink;
