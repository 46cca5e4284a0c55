#![forbid(unsafe_code)]

mod adapter;
pub mod irc;
mod transport;

pub use adapter::{
	DEFAULT_IRC_HOST, DEFAULT_PLAIN_PORT, DEFAULT_TLS_PORT, TwitchIrcAdapter, TwitchIrcConfig, TwitchIrcSource,
};
pub use transport::{BoxedIrcStream, IrcConnector, IrcEndpoint, IrcStream, default_connector};
