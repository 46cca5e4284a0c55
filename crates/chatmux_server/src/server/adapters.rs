#![forbid(unsafe_code)]

use std::sync::Arc;

use chatmux_platform::facebook::{FacebookConfig, FacebookSource};
use chatmux_platform::instagram::{InstagramConfig, InstagramSource};
use chatmux_platform::twitch::{DEFAULT_PLAIN_PORT, TwitchIrcConfig, TwitchIrcSource};
use chatmux_platform::youtube::{YouTubeConfig, YouTubeSource};
use chatmux_platform::{Adapter, ChatAdapter, ChatSource, FanoutBus, QuotaGovernor, ReconnectPolicy};
use tracing::info;

use crate::config::ServerConfig;

/// Build one adapter per configured platform. Scraping adapters need an
/// embedding browser host and are not built by the daemon.
pub fn build_adapters(cfg: &ServerConfig, bus: &FanoutBus, quota: &Arc<QuotaGovernor>) -> Vec<Arc<dyn ChatAdapter>> {
	let mut adapters: Vec<Arc<dyn ChatAdapter>> = Vec::new();

	if let Some(channel) = cfg.twitch.channel.as_deref() {
		let mut twitch = TwitchIrcConfig::new(channel);
		twitch.username = cfg.twitch.username.clone();
		twitch.oauth_token = cfg.twitch.oauth_token.clone();
		if let Some(host) = cfg.twitch.host.clone() {
			twitch.host = host;
		}
		if let Some(tls) = cfg.twitch.tls {
			twitch.tls = tls;
			if !tls {
				twitch.port = DEFAULT_PLAIN_PORT;
			}
		}
		if let Some(port) = cfg.twitch.port {
			twitch.port = port;
		}
		info!(%channel, anonymous = twitch.oauth_token.is_none(), "twitch irc adapter configured");
		adapters.push(finish(TwitchIrcSource::new(twitch).into_adapter(bus.clone()), cfg));
	}

	if cfg.youtube.is_configured() {
		let mut youtube = YouTubeConfig {
			api_key: cfg.youtube.api_key.clone(),
			video_id: cfg.youtube.video_id.clone(),
			channel_id: cfg.youtube.channel_id.clone(),
			skip_backlog: cfg.youtube.skip_backlog,
			..Default::default()
		};
		if let Some(min) = cfg.youtube.min_poll_interval {
			youtube.min_poll_interval = min;
		}
		if let Some(max) = cfg.youtube.max_poll_interval {
			youtube.max_poll_interval = max;
		}
		info!(daily_quota = quota.limit(), "youtube polling adapter configured");
		adapters.push(finish(
			YouTubeSource::new(youtube, Arc::clone(quota)).into_adapter(bus.clone()),
			cfg,
		));
	}

	if cfg.facebook.is_configured() {
		let mut facebook = FacebookConfig {
			live_video_id: cfg.facebook.live_video_id.clone(),
			access_token: cfg.facebook.access_token.clone(),
			..Default::default()
		};
		if let Some(rate) = cfg.facebook.comment_rate.clone() {
			facebook.comment_rate = rate;
		}
		info!("facebook comment stream adapter configured");
		adapters.push(finish(FacebookSource::new(facebook).into_adapter(bus.clone()), cfg));
	}

	if cfg.instagram.is_configured() {
		let mut instagram = InstagramConfig {
			target_user_id: cfg.instagram.target_user_id.clone(),
			session_id: cfg.instagram.session_id.clone(),
			csrf_token: cfg.instagram.csrf_token.clone(),
			ig_user_id: cfg.instagram.ig_user_id.clone(),
			graph_access_token: cfg.instagram.graph_access_token.clone(),
			..Default::default()
		};
		if let Some(interval) = cfg.instagram.poll_interval {
			instagram.poll_interval = interval;
		}
		if let Some(attempts) = cfg.instagram.discovery_attempts {
			instagram.discovery_attempts = attempts;
		}
		info!("instagram dual-api adapter configured");
		adapters.push(finish(InstagramSource::new(instagram).into_adapter(bus.clone()), cfg));
	}

	adapters
}

fn finish<S: ChatSource>(adapter: Adapter<S>, cfg: &ServerConfig) -> Arc<dyn ChatAdapter> {
	Arc::new(
		adapter
			.with_reconnect_policy(ReconnectPolicy {
				max_attempts: cfg.reconnect.max_attempts,
				base_delay: cfg.reconnect.base_delay,
				max_delay: cfg.reconnect.max_delay,
			})
			.with_stop_timeout(cfg.server.stop_timeout),
	)
}

#[cfg(test)]
mod tests {
	use chatmux_domain::{ConnectionState, Platform};
	use chatmux_platform::SecretString;

	use super::*;

	#[tokio::test]
	async fn nothing_configured_builds_nothing() {
		let adapters = build_adapters(
			&ServerConfig::default(),
			&FanoutBus::default(),
			&Arc::new(QuotaGovernor::new(10_000)),
		);
		assert!(adapters.is_empty());
	}

	#[tokio::test]
	async fn builds_configured_platforms_in_order() {
		let mut cfg = ServerConfig::default();
		cfg.instagram.ig_user_id = Some("1784".into());
		cfg.twitch.channel = Some("somechannel".into());
		cfg.facebook.live_video_id = Some("555".into());
		cfg.facebook.access_token = Some(SecretString::new("tok"));

		let adapters = build_adapters(&cfg, &FanoutBus::default(), &Arc::new(QuotaGovernor::new(10_000)));
		let platforms: Vec<Platform> = adapters.iter().map(|a| a.platform()).collect();
		assert_eq!(platforms, vec![Platform::Twitch, Platform::Facebook, Platform::Instagram]);
		assert!(adapters.iter().all(|a| a.state() == ConnectionState::Disconnected));
	}
}
