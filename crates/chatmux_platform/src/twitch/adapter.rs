#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chatmux_domain::Platform;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::irc::{IrcMessage, chat_message_from_privmsg, chat_message_from_usernotice, is_auth_failure_notice};
use super::transport::{BoxedIrcStream, IrcConnector, IrcEndpoint, default_connector};
use crate::error::SourceError;
use crate::lifecycle::{Adapter, ChatSource, LoopContext};
use crate::{FanoutBus, SecretString, new_session_id, non_blank_secret};

pub const DEFAULT_IRC_HOST: &str = "irc.chat.twitch.tv";
pub const DEFAULT_TLS_PORT: u16 = 6697;
pub const DEFAULT_PLAIN_PORT: u16 = 6667;

/// Twitch IRC adapter configuration.
#[derive(Clone)]
pub struct TwitchIrcConfig {
	pub channel: String,
	/// Login name; required when `oauth_token` is set.
	pub username: Option<String>,
	/// Without a token the adapter joins read-only as `justinfanNNNNN`.
	pub oauth_token: Option<SecretString>,
	pub host: String,
	pub port: u16,
	pub tls: bool,
	pub connect_timeout: Duration,
	/// Reads silent for this long count as a lost connection.
	pub idle_timeout: Duration,
	pub connector: Option<IrcConnector>,
}

impl TwitchIrcConfig {
	pub fn new(channel: impl Into<String>) -> Self {
		Self {
			channel: channel.into(),
			username: None,
			oauth_token: None,
			host: DEFAULT_IRC_HOST.to_string(),
			port: DEFAULT_TLS_PORT,
			tls: true,
			connect_timeout: Duration::from_secs(10),
			idle_timeout: Duration::from_secs(360),
			connector: None,
		}
	}

	pub fn with_credentials(mut self, username: impl Into<String>, oauth_token: SecretString) -> Self {
		self.username = Some(username.into());
		self.oauth_token = Some(oauth_token);
		self
	}

	pub fn with_connector(mut self, connector: IrcConnector) -> Self {
		self.connector = Some(connector);
		self
	}

	fn endpoint(&self) -> IrcEndpoint {
		IrcEndpoint {
			host: self.host.clone(),
			port: self.port,
			tls: self.tls,
		}
	}

	fn channel_login(&self) -> String {
		self.channel.trim().trim_start_matches('#').to_ascii_lowercase()
	}
}

impl fmt::Debug for TwitchIrcConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TwitchIrcConfig")
			.field("channel", &self.channel)
			.field("username", &self.username)
			.field("oauth_token", &self.oauth_token)
			.field("host", &self.host)
			.field("port", &self.port)
			.field("tls", &self.tls)
			.field("idle_timeout", &self.idle_timeout)
			.field("custom_connector", &self.connector.is_some())
			.finish()
	}
}

/// `(pass, nick)` to log in with. Anonymous logins get a random justinfan nick.
fn login_lines(config: &TwitchIrcConfig) -> Result<(String, String), SourceError> {
	match non_blank_secret(config.oauth_token.as_ref()) {
		Some(token) => {
			let nick = config
				.username
				.as_deref()
				.map(str::trim)
				.filter(|u| !u.is_empty())
				.ok_or_else(|| SourceError::MissingCredentials("twitch username is required with an oauth token".into()))?;
			let token = token.strip_prefix("oauth:").unwrap_or(token);
			Ok((format!("oauth:{token}"), nick.to_ascii_lowercase()))
		}
		None => {
			let n: u32 = rand::rng().random_range(10_000..100_000);
			Ok(("SCHMOOPIIE".to_string(), format!("justinfan{n}")))
		}
	}
}

struct IrcSession {
	id: String,
	reader: BufReader<ReadHalf<BoxedIrcStream>>,
	writer: WriteHalf<BoxedIrcStream>,
}

enum PumpExit {
	Cancelled,
	AuthFailed(String),
	Lost(String),
}

async fn write_line(writer: &mut WriteHalf<BoxedIrcStream>, line: &str) -> std::io::Result<()> {
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\r\n").await?;
	writer.flush().await
}

/// Twitch chat over the IRC socket interface.
pub struct TwitchIrcSource {
	config: TwitchIrcConfig,
	connector: IrcConnector,
	session: Mutex<Option<IrcSession>>,
}

pub type TwitchIrcAdapter = Adapter<TwitchIrcSource>;

impl TwitchIrcSource {
	pub fn new(config: TwitchIrcConfig) -> Self {
		let connector = config
			.connector
			.clone()
			.unwrap_or_else(|| default_connector(config.connect_timeout));
		Self {
			config,
			connector,
			session: Mutex::new(None),
		}
	}

	pub fn into_adapter(self, bus: FanoutBus) -> TwitchIrcAdapter {
		Adapter::new(self, bus)
	}

	async fn handshake(&self, stream: BoxedIrcStream) -> Result<IrcSession, SourceError> {
		let channel = self.config.channel_login();
		let (pass, nick) = login_lines(&self.config)?;

		let (read, mut writer) = tokio::io::split(stream);
		for line in [
			format!("PASS {pass}"),
			format!("NICK {nick}"),
			"CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
			format!("JOIN #{channel}"),
		] {
			write_line(&mut writer, &line)
				.await
				.map_err(|e| SourceError::Transport(anyhow::Error::new(e).context("irc handshake write")))?;
		}

		let id = new_session_id();
		info!(platform = %Platform::Twitch, %channel, %nick, session_id = %id, "irc session opened");
		Ok(IrcSession {
			id,
			reader: BufReader::new(read),
			writer,
		})
	}

	async fn pump(&self, session: &mut IrcSession, ctx: &LoopContext) -> PumpExit {
		let idle = self.config.idle_timeout;
		let mut line = String::new();

		loop {
			line.clear();
			let read = tokio::select! {
				biased;
				_ = ctx.cancelled() => return PumpExit::Cancelled,
				r = tokio::time::timeout(idle, session.reader.read_line(&mut line)) => r,
			};

			match read {
				Err(_) => return PumpExit::Lost(format!("no data for {}s", idle.as_secs())),
				Ok(Err(e)) => return PumpExit::Lost(format!("read failed: {e}")),
				Ok(Ok(0)) => return PumpExit::Lost("connection closed by server".to_string()),
				Ok(Ok(_)) => {}
			}

			metrics::counter!("chatmux_irc_lines_total", "platform" => "twitch").increment(1);
			let Some(msg) = IrcMessage::parse(&line) else {
				continue;
			};

			match msg.command.as_str() {
				"PING" => {
					let payload = msg
						.trailing
						.as_deref()
						.or(msg.params.first().map(String::as_str))
						.unwrap_or("tmi.twitch.tv");
					if let Err(e) = write_line(&mut session.writer, &format!("PONG :{payload}")).await {
						return PumpExit::Lost(format!("pong failed: {e}"));
					}
				}
				"PRIVMSG" => match chat_message_from_privmsg(&msg) {
					Some(chat) => {
						ctx.publish(msg.tag("id").map(|id| format!("twitch:{id}")), chat);
					}
					None => debug!(session_id = %session.id, line = %line.trim_end(), "unparseable PRIVMSG"),
				},
				"USERNOTICE" => {
					if let Some(chat) = chat_message_from_usernotice(&msg) {
						ctx.publish(msg.tag("id").map(|id| format!("twitch:{id}")), chat);
					}
				}
				"NOTICE" => {
					let text = msg.trailing.clone().unwrap_or_default();
					if is_auth_failure_notice(&text) {
						return PumpExit::AuthFailed(text);
					}
					debug!(session_id = %session.id, notice = %text, "irc notice");
				}
				"RECONNECT" => return PumpExit::Lost("server requested reconnect".to_string()),
				"001" => debug!(session_id = %session.id, "irc login accepted"),
				"JOIN" => debug!(session_id = %session.id, channel = ?msg.channel(), "joined channel"),
				_ => {}
			}
		}
	}
}

#[async_trait::async_trait]
impl ChatSource for TwitchIrcSource {
	fn platform(&self) -> Platform {
		Platform::Twitch
	}

	async fn connect(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
		if self.config.channel_login().is_empty() {
			return Err(SourceError::setup("twitch channel is not configured"));
		}
		login_lines(&self.config)?;

		let stream = (self.connector)(self.config.endpoint()).await?;
		let session = self.handshake(stream).await?;
		*self.session.lock().await = Some(session);
		Ok(())
	}

	async fn disconnect(&self) {
		let Some(mut session) = self.session.lock().await.take() else {
			return;
		};
		let channel = self.config.channel_login();
		let goodbye = async {
			let _ = write_line(&mut session.writer, &format!("PART #{channel}")).await;
			let _ = session.writer.shutdown().await;
		};
		if tokio::time::timeout(Duration::from_secs(1), goodbye).await.is_err() {
			debug!(session_id = %session.id, "irc shutdown timed out");
		}
	}

	async fn run_receive_loop(self: Arc<Self>, ctx: LoopContext) {
		loop {
			let taken = self.session.lock().await.take();
			let exit = match taken {
				Some(mut session) => {
					let exit = self.pump(&mut session, &ctx).await;
					if matches!(exit, PumpExit::Cancelled) {
						*self.session.lock().await = Some(session);
					}
					exit
				}
				None => PumpExit::Lost("no irc session".to_string()),
			};

			match exit {
				PumpExit::Cancelled => return,
				PumpExit::AuthFailed(reason) => {
					ctx.authentication_failed(reason);
					return;
				}
				PumpExit::Lost(reason) => {
					warn!(platform = %Platform::Twitch, %reason, "irc connection lost");
					if ctx.reconnect(&*self).await.is_err() {
						return;
					}
				}
			}
		}
	}
}
