#![forbid(unsafe_code)]

mod adapter;
pub mod graph_api;
pub mod private_api;
pub mod scheduler;

pub use adapter::{InstagramAdapter, InstagramConfig, InstagramSource};
pub use scheduler::{ApiSlot, FailoverScheduler, Pick};
