#![forbid(unsafe_code)]

mod adapter;
pub mod sse;

pub use adapter::{
	DEFAULT_STREAMING_BASE_URL, FacebookAdapter, FacebookConfig, FacebookSource, comment_from_event, parse_created_time,
};
pub use sse::{SseDecoder, SseEvent};
