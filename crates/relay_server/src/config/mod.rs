#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_broker::BrokerConfig;
use relay_domain::AccountName;
use relay_platform::ClientSettings;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::account_manager::AccountManagerConfig;

/// Default config path: `~/.relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay").join("config.toml"))
}

/// Default database: `~/.relay/relay.db`, falling back to the working directory.
fn default_database_url() -> String {
	match dirs::home_dir() {
		Some(home) => format!("sqlite://{}", home.join(".relay").join("relay.db").display()),
		None => "sqlite://relay.db".to_string(),
	}
}

/// Load the server config from TOML at `path` and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub store: StoreSettings,
	pub manager: AccountManagerConfig,
	pub directory: DirectorySettings,
}

/// Process-level endpoints.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
	/// `memory:`, `sqlite:` or `postgres:` URL.
	pub database_url: String,
}

/// Directory-service broker settings.
#[derive(Debug, Clone, Default)]
pub struct DirectorySettings {
	/// `tcp://host:port`; the broker is not started without it.
	pub endpoint: Option<String>,
	pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	manager: FileManagerSettings,

	#[serde(default)]
	client: FileClientSettings,

	#[serde(default)]
	directory: FileDirectorySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileManagerSettings {
	accounts: Option<Vec<String>>,
	refresh_interval_secs: Option<u64>,
	poll_delay_ms: Option<u64>,
	tail_batch: Option<usize>,
	incoming_capacity: Option<usize>,
	request_timeout_ms: Option<u64>,
	stop_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileClientSettings {
	outgoing_capacity: Option<usize>,
	control_timeout_ms: Option<u64>,
	stop_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDirectorySettings {
	enabled: Option<bool>,
	endpoint: Option<String>,
	request_timeout_ms: Option<u64>,
	dial_timeout_secs: Option<u64>,
	keepalive_secs: Option<u64>,
	backoff_secs: Option<u64>,
}

fn parse_allowlist<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<BTreeSet<AccountName>> {
	let mut allowed = BTreeSet::new();
	for raw in names {
		match AccountName::new(raw.trim()) {
			Ok(name) => {
				allowed.insert(name);
			}
			Err(_) => warn!(name = %raw, "ignoring empty account name in allow-list"),
		}
	}
	if allowed.is_empty() { None } else { Some(allowed) }
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let client_defaults = ClientSettings::default();
		let client = ClientSettings {
			outgoing_capacity: file
				.client
				.outgoing_capacity
				.filter(|v| *v > 0)
				.unwrap_or(client_defaults.outgoing_capacity),
			control_timeout: file
				.client
				.control_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(client_defaults.control_timeout),
			stop_timeout: file
				.client
				.stop_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(client_defaults.stop_timeout),
			..client_defaults
		};

		let manager_defaults = AccountManagerConfig::default();
		let manager = AccountManagerConfig {
			allowlist: file
				.manager
				.accounts
				.as_ref()
				.and_then(|names| parse_allowlist(names.iter().map(String::as_str))),
			refresh_interval: file
				.manager
				.refresh_interval_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(manager_defaults.refresh_interval),
			poll_delay: file
				.manager
				.poll_delay_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(manager_defaults.poll_delay),
			tail_batch: file
				.manager
				.tail_batch
				.filter(|v| *v > 0)
				.unwrap_or(manager_defaults.tail_batch),
			incoming_capacity: file
				.manager
				.incoming_capacity
				.filter(|v| *v > 0)
				.unwrap_or(manager_defaults.incoming_capacity),
			request_timeout: file
				.manager
				.request_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(manager_defaults.request_timeout),
			stop_timeout: file
				.manager
				.stop_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(manager_defaults.stop_timeout),
			client,
		};

		let broker_defaults = BrokerConfig::default();
		let directory = DirectorySettings {
			endpoint: file
				.directory
				.endpoint
				.filter(|s| !s.trim().is_empty())
				.filter(|_| file.directory.enabled.unwrap_or(true)),
			broker: BrokerConfig {
				request_timeout: file
					.directory
					.request_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(broker_defaults.request_timeout),
				dial_timeout: file
					.directory
					.dial_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(broker_defaults.dial_timeout),
				keepalive_interval: file
					.directory
					.keepalive_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(broker_defaults.keepalive_interval),
				backoff: file
					.directory
					.backoff_secs
					.map(Duration::from_secs)
					.unwrap_or(broker_defaults.backoff),
			},
		};

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			store: StoreSettings {
				database_url: file
					.store
					.database_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(default_database_url),
			},
			manager,
			directory,
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

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("RELAY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("RELAY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("RELAY_DATABASE_URL") {
		cfg.store.database_url = v;
		info!("store config: database_url overridden by env");
	}

	if let Some(v) = non_empty("RELAY_ACCOUNTS") {
		cfg.manager.allowlist = parse_allowlist(v.split(','));
		info!(
			accounts = cfg.manager.allowlist.as_ref().map(|a| a.len()).unwrap_or(0),
			"manager config: account allow-list overridden by env"
		);
	}

	if let Some(v) = non_empty("RELAY_REFRESH_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.manager.refresh_interval = Duration::from_secs(secs);
		info!(secs, "manager config: refresh_interval overridden by env");
	}

	if let Some(v) = non_empty("RELAY_POLL_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.manager.poll_delay = Duration::from_millis(ms);
		info!(ms, "manager config: poll_delay overridden by env");
	}

	if let Some(v) = non_empty("RELAY_DIRECTORY_ENDPOINT") {
		cfg.directory.endpoint = Some(v);
		info!("directory config: endpoint overridden by env");
	}

	if let Some(v) = non_empty("RELAY_DIRECTORY_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
		&& !enabled
	{
		cfg.directory.endpoint = None;
		info!("directory config: disabled by env");
	}

	if cfg.manager.allowlist.is_none() {
		info!("manager config: no account allow-list; every enabled account may run");
	}

	if cfg.directory.broker.request_timeout >= cfg.directory.broker.keepalive_interval {
		warn!(
			request_timeout_ms = cfg.directory.broker.request_timeout.as_millis(),
			keepalive_ms = cfg.directory.broker.keepalive_interval.as_millis(),
			"directory config: request_timeout is not shorter than keepalive interval"
		);
	}
}
