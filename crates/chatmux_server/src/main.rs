#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chatmux_platform::bus::BusConfig;
use chatmux_platform::{FanoutBus, QuotaGovernor};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::adapter_manager::AdapterManager;
use crate::server::adapters::build_adapters;
use crate::server::sink::{LogSink, spawn_quota_logger};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatmux_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.chatmux/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,chatmux_server=debug,chatmux_platform=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bus = FanoutBus::new(BusConfig {
		subscriber_queue_capacity: cfg.server.subscriber_queue_capacity,
		..BusConfig::default()
	});
	let _log_sink = bus.subscribe_handler(LogSink::new(cfg.server.log_messages));

	let quota = Arc::new(QuotaGovernor::new(cfg.youtube.daily_quota));
	spawn_quota_logger(&quota);

	let manager = AdapterManager::new(build_adapters(&cfg, &bus, &quota));
	if manager.is_empty() {
		warn!(path = %config_path.display(), "no platforms configured; waiting for shutdown");
	}
	manager.start_all().await;

	tokio::signal::ctrl_c().await.context("listen for shutdown signal")?;
	info!(adapters = manager.len(), "shutdown requested");
	for (platform, state, last_error) in manager.states() {
		info!(%platform, %state, last_error = last_error.as_deref().unwrap_or("none"), "adapter status");
	}
	manager.stop_all().await;

	let quota = quota.snapshot();
	info!(used = quota.used, limit = quota.limit, tier = %quota.tier, "youtube quota at shutdown");
	Ok(())
}
