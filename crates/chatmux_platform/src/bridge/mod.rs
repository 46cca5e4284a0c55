#![forbid(unsafe_code)]

mod adapter;
mod host;
pub mod message;
mod profile;
pub mod script;

pub use adapter::{BridgeConfig, ScrapeAdapter, ScrapeSource};
pub use host::{BrowserHost, HostMessageHandler};
pub use message::{BridgeMessage, ScrapedItem};
pub use profile::ScrapeProfile;
pub use script::{DEFAULT_POST_EXPRESSION, HEALTH_CHECK_SCRIPT, TEARDOWN_SCRIPT, observer_script};
