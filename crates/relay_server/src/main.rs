#![forbid(unsafe_code)]

mod adapters;
mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use relay_broker::ConnectionBroker;
use relay_broker::directory::{DirectoryBroker, DirectoryConnector};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::adapters::DefaultAdapterFactory;
use crate::server::account_manager::AccountManager;
use crate::server::health::{HealthState, spawn_health_server};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.relay/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut config = None;

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
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	Args { config }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relay_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
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
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	if let Some(parent) = cfg
		.store
		.database_url
		.strip_prefix("sqlite://")
		.and_then(|p| std::path::Path::new(p).parent())
		.filter(|p| !p.as_os_str().is_empty())
	{
		std::fs::create_dir_all(parent).with_context(|| format!("create database directory {}", parent.display()))?;
	}
	let store = relay_store::connect(&cfg.store.database_url)
		.await
		.context("open message store")?;
	info!("message store ready");

	let directory: Option<DirectoryBroker> = match cfg.directory.endpoint.as_deref() {
		Some(endpoint) => {
			let connector = DirectoryConnector::new(endpoint)?;
			info!(endpoint = %endpoint, "starting directory broker");
			Some(ConnectionBroker::start(connector, cfg.directory.broker.clone()))
		}
		None => None,
	};

	let mut health_state = HealthState::new();
	if let Some(broker) = &directory {
		health_state = health_state.with_directory(broker.acquire());
	}
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let manager = AccountManager::start(store, Arc::new(DefaultAdapterFactory::new()), cfg.manager.clone());
	match manager.registered_accounts().await {
		Ok(accounts) => {
			let names: Vec<&str> = accounts.iter().map(|a| a.as_str()).collect();
			info!(count = names.len(), accounts = ?names, "initial account pass complete");
		}
		Err(e) => warn!(error = %e, "failed to list registered accounts"),
	}
	health_state.mark_ready();

	tokio::select! {
		res = tokio::signal::ctrl_c() => {
			if let Err(e) = res {
				warn!(error = %e, "failed to listen for ctrl-c; shutting down");
			}
			info!("shutdown requested");
		}
		_ = manager.stopped() => {
			warn!("account manager exited on its own");
		}
	}

	health_state.mark_not_ready();
	let outcome = manager.stop().await;

	health_state.close_directory();
	if let Some(broker) = directory {
		broker.close();
	}

	match outcome {
		Ok(()) => {
			info!("relay_server stopped");
			Ok(())
		}
		Err(e) => Err(anyhow::Error::new(e).context("account manager failed")),
	}
}
