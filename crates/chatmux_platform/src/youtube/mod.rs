#![forbid(unsafe_code)]

mod adapter;
pub mod client;
mod mapping;

pub use adapter::{YouTubeAdapter, YouTubeConfig, YouTubeSource, error_backoff, next_poll_delay};
pub use client::{DEFAULT_YOUTUBE_BASE_URL, YouTubeApiError, YouTubeClient};
pub use mapping::message_from_item;
