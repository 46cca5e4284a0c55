#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatmux_platform::SecretString;
use chatmux_platform::lifecycle::DEFAULT_STOP_TIMEOUT;
use chatmux_platform::quota::DEFAULT_DAILY_LIMIT;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chatmux/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatmux").join("config.toml"))
}

/// Load the daemon config from TOML at `path`, then apply `CHATMUX_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub reconnect: ReconnectSettings,
	pub twitch: TwitchSettings,
	pub youtube: YouTubeSettings,
	pub facebook: FacebookSettings,
	pub instagram: InstagramSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Bounded wait for each adapter's receive loop on shutdown.
	pub stop_timeout: Duration,
	/// Log every normalized message at `info`.
	pub log_messages: bool,
	pub subscriber_queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ReconnectSettings {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
}

/// An adapter is built when `channel` is set.
#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub channel: Option<String>,
	pub username: Option<String>,
	pub oauth_token: Option<SecretString>,
	pub host: Option<String>,
	pub port: Option<u16>,
	pub tls: Option<bool>,
}

/// An adapter is built when either `video_id` or `channel_id` is set.
#[derive(Debug, Clone)]
pub struct YouTubeSettings {
	pub api_key: Option<SecretString>,
	pub video_id: Option<String>,
	pub channel_id: Option<String>,
	pub daily_quota: u64,
	pub min_poll_interval: Option<Duration>,
	pub max_poll_interval: Option<Duration>,
	pub skip_backlog: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FacebookSettings {
	pub live_video_id: Option<String>,
	pub access_token: Option<SecretString>,
	pub comment_rate: Option<String>,
}

/// An adapter is built when either API has its target id.
#[derive(Debug, Clone, Default)]
pub struct InstagramSettings {
	pub target_user_id: Option<String>,
	pub session_id: Option<SecretString>,
	pub csrf_token: Option<SecretString>,
	pub ig_user_id: Option<String>,
	pub graph_access_token: Option<SecretString>,
	pub poll_interval: Option<Duration>,
	pub discovery_attempts: Option<u32>,
}

impl YouTubeSettings {
	pub fn is_configured(&self) -> bool {
		self.video_id.is_some() || self.channel_id.is_some()
	}
}

impl FacebookSettings {
	pub fn is_configured(&self) -> bool {
		self.live_video_id.is_some()
	}
}

impl InstagramSettings {
	pub fn is_configured(&self) -> bool {
		self.target_user_id.is_some() || self.ig_user_id.is_some()
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	reconnect: FileReconnectSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	youtube: FileYouTubeSettings,

	#[serde(default)]
	facebook: FileFacebookSettings,

	#[serde(default)]
	instagram: FileInstagramSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	stop_timeout_ms: Option<u64>,
	log_messages: Option<bool>,
	subscriber_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReconnectSettings {
	max_attempts: Option<u32>,
	base_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	channel: Option<String>,
	username: Option<String>,
	oauth_token: Option<String>,
	host: Option<String>,
	port: Option<u16>,
	tls: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileYouTubeSettings {
	api_key: Option<String>,
	video_id: Option<String>,
	channel_id: Option<String>,
	daily_quota: Option<u64>,
	min_poll_interval_ms: Option<u64>,
	max_poll_interval_ms: Option<u64>,
	skip_backlog: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFacebookSettings {
	live_video_id: Option<String>,
	access_token: Option<String>,
	comment_rate: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileInstagramSettings {
	target_user_id: Option<String>,
	session_id: Option<String>,
	csrf_token: Option<String>,
	ig_user_id: Option<String>,
	graph_access_token: Option<String>,
	poll_interval_ms: Option<u64>,
	discovery_attempts: Option<u32>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secret(v: Option<String>) -> Option<SecretString> {
	non_blank(v).map(SecretString::new)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = chatmux_platform::ReconnectPolicy::default();

		Self {
			server: ServerSettings {
				metrics_bind: non_blank(file.server.metrics_bind),
				stop_timeout: file
					.server
					.stop_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(DEFAULT_STOP_TIMEOUT),
				log_messages: file.server.log_messages.unwrap_or(true),
				subscriber_queue_capacity: file.server.subscriber_queue_capacity.filter(|v| *v > 0).unwrap_or(1024),
			},
			reconnect: ReconnectSettings {
				max_attempts: file.reconnect.max_attempts.unwrap_or(defaults.max_attempts),
				base_delay: file
					.reconnect
					.base_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.base_delay),
				max_delay: file
					.reconnect
					.max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.max_delay),
			},
			twitch: TwitchSettings {
				channel: non_blank(file.twitch.channel),
				username: non_blank(file.twitch.username),
				oauth_token: secret(file.twitch.oauth_token),
				host: non_blank(file.twitch.host),
				port: file.twitch.port,
				tls: file.twitch.tls,
			},
			youtube: YouTubeSettings {
				api_key: secret(file.youtube.api_key),
				video_id: non_blank(file.youtube.video_id),
				channel_id: non_blank(file.youtube.channel_id),
				daily_quota: file.youtube.daily_quota.filter(|v| *v > 0).unwrap_or(DEFAULT_DAILY_LIMIT),
				min_poll_interval: file.youtube.min_poll_interval_ms.map(Duration::from_millis),
				max_poll_interval: file.youtube.max_poll_interval_ms.map(Duration::from_millis),
				skip_backlog: file.youtube.skip_backlog.unwrap_or(true),
			},
			facebook: FacebookSettings {
				live_video_id: non_blank(file.facebook.live_video_id),
				access_token: secret(file.facebook.access_token),
				comment_rate: non_blank(file.facebook.comment_rate),
			},
			instagram: InstagramSettings {
				target_user_id: non_blank(file.instagram.target_user_id),
				session_id: secret(file.instagram.session_id),
				csrf_token: secret(file.instagram.csrf_token),
				ig_user_id: non_blank(file.instagram.ig_user_id),
				graph_access_token: secret(file.instagram.graph_access_token),
				poll_interval: file.instagram.poll_interval_ms.map(Duration::from_millis),
				discovery_attempts: file.instagram.discovery_attempts,
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides(cfg, |name| std::env::var(name).ok());
}

/// `lookup` returns raw values; blank values count as unset.
fn apply_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = get("CHATMUX_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = get("CHATMUX_STOP_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.stop_timeout = Duration::from_millis(ms);
		info!(ms, "server config: stop_timeout overridden by env");
	}

	if let Some(v) = get("CHATMUX_LOG_MESSAGES")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.log_messages = enabled;
		info!(enabled, "server config: log_messages overridden by env");
	}

	if let Some(v) = get("CHATMUX_RECONNECT_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.parse::<u32>()
	{
		cfg.reconnect.max_attempts = attempts;
		info!(attempts, "reconnect config: max_attempts overridden by env");
	}

	if let Some(v) = get("CHATMUX_RECONNECT_BASE_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.reconnect.base_delay = Duration::from_millis(ms);
		info!(ms, "reconnect config: base_delay overridden by env");
	}

	if let Some(v) = get("CHATMUX_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.reconnect.max_delay = Duration::from_millis(ms);
		info!(ms, "reconnect config: max_delay overridden by env");
	}

	if let Some(v) = get("CHATMUX_TWITCH_CHANNEL") {
		cfg.twitch.channel = Some(v);
		info!("twitch config: channel overridden by env");
	}

	if let Some(v) = get("CHATMUX_TWITCH_USERNAME") {
		cfg.twitch.username = Some(v);
		info!("twitch config: username overridden by env");
	}

	if let Some(v) = get("CHATMUX_TWITCH_OAUTH_TOKEN") {
		cfg.twitch.oauth_token = Some(SecretString::new(v));
		info!("twitch config: oauth_token overridden by env");
	}

	if let Some(v) = get("CHATMUX_YOUTUBE_API_KEY") {
		cfg.youtube.api_key = Some(SecretString::new(v));
		info!("youtube config: api_key overridden by env");
	}

	if let Some(v) = get("CHATMUX_YOUTUBE_VIDEO_ID") {
		cfg.youtube.video_id = Some(v);
		info!("youtube config: video_id overridden by env");
	}

	if let Some(v) = get("CHATMUX_YOUTUBE_CHANNEL_ID") {
		cfg.youtube.channel_id = Some(v);
		info!("youtube config: channel_id overridden by env");
	}

	if let Some(v) = get("CHATMUX_YOUTUBE_DAILY_QUOTA")
		&& let Ok(limit) = v.parse::<u64>()
		&& limit > 0
	{
		cfg.youtube.daily_quota = limit;
		info!(limit, "youtube config: daily_quota overridden by env");
	}

	if let Some(v) = get("CHATMUX_FACEBOOK_LIVE_VIDEO_ID") {
		cfg.facebook.live_video_id = Some(v);
		info!("facebook config: live_video_id overridden by env");
	}

	if let Some(v) = get("CHATMUX_FACEBOOK_ACCESS_TOKEN") {
		cfg.facebook.access_token = Some(SecretString::new(v));
		info!("facebook config: access_token overridden by env");
	}

	if let Some(v) = get("CHATMUX_INSTAGRAM_TARGET_USER_ID") {
		cfg.instagram.target_user_id = Some(v);
		info!("instagram config: target_user_id overridden by env");
	}

	if let Some(v) = get("CHATMUX_INSTAGRAM_SESSION_ID") {
		cfg.instagram.session_id = Some(SecretString::new(v));
		info!("instagram config: session_id overridden by env");
	}

	if let Some(v) = get("CHATMUX_INSTAGRAM_CSRF_TOKEN") {
		cfg.instagram.csrf_token = Some(SecretString::new(v));
		info!("instagram config: csrf_token overridden by env");
	}

	if let Some(v) = get("CHATMUX_INSTAGRAM_IG_USER_ID") {
		cfg.instagram.ig_user_id = Some(v);
		info!("instagram config: ig_user_id overridden by env");
	}

	if let Some(v) = get("CHATMUX_INSTAGRAM_GRAPH_ACCESS_TOKEN") {
		cfg.instagram.graph_access_token = Some(SecretString::new(v));
		info!("instagram config: graph_access_token overridden by env");
	}

	if cfg.reconnect.base_delay > cfg.reconnect.max_delay {
		warn!(
			base_ms = cfg.reconnect.base_delay.as_millis() as u64,
			max_ms = cfg.reconnect.max_delay.as_millis() as u64,
			"reconnect config: base_delay > max_delay; swapping"
		);
		std::mem::swap(&mut cfg.reconnect.base_delay, &mut cfg.reconnect.max_delay);
	}

	if cfg.youtube.is_configured() && cfg.youtube.api_key.is_none() {
		warn!("youtube config: target set but no api_key; the adapter will fail to start");
	}
}
