#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use relay_domain::{AccountInfo, AccountName, Message, MessageId};
use relay_platform::{AccountClient, AdapterFactory, ClientSettings};
use relay_store::MessageStore;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::tailer::Tailer;

/// Account manager configuration.
#[derive(Debug, Clone)]
pub struct AccountManagerConfig {
	/// Only these accounts may run. `None` allows every enabled account.
	pub allowlist: Option<BTreeSet<AccountName>>,
	pub refresh_interval: Duration,
	/// Tailer sleep when the outgoing lane is drained.
	pub poll_delay: Duration,
	pub tail_batch: usize,
	pub incoming_capacity: usize,
	/// Bound for requests made through [`AccountManager`].
	pub request_timeout: Duration,
	/// Bound for [`AccountManager::stop`].
	pub stop_timeout: Duration,
	pub client: ClientSettings,
}

impl Default for AccountManagerConfig {
	fn default() -> Self {
		Self {
			allowlist: None,
			refresh_interval: Duration::from_secs(60),
			poll_delay: Duration::from_secs(1),
			tail_batch: 100,
			incoming_capacity: 64,
			request_timeout: Duration::from_secs(10),
			stop_timeout: Duration::from_secs(30),
			client: ClientSettings::default(),
		}
	}
}

impl AccountManagerConfig {
	fn allows(&self, info: &AccountInfo) -> bool {
		info.enabled && self.allowlist.as_ref().is_none_or(|allowed| allowed.contains(&info.name))
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
	#[error("account manager is stopped")]
	Stopped,

	#[error("account manager {0} timed out")]
	Timeout(&'static str),

	/// A delivered message could not be recorded; delivery guarantees no longer hold.
	#[error("account {account}: echo of delivered message {id} not recorded: {reason}")]
	Durability {
		account: AccountName,
		id: MessageId,
		reason: String,
	},

	#[error("account manager task panicked")]
	Panicked,
}

#[derive(Debug)]
enum ManagerRequest {
	Refresh { resp: oneshot::Sender<()> },
	Accounts { resp: oneshot::Sender<Vec<AccountName>> },
}

enum Lifecycle {
	Running(JoinHandle<Result<(), ManagerError>>),
	Finished(Result<(), ManagerError>),
}

/// Handle to the account manager task.
pub struct AccountManager {
	requests_tx: mpsc::Sender<ManagerRequest>,
	shutdown: CancellationToken,
	exited: CancellationToken,
	lifecycle: Mutex<Lifecycle>,
	request_timeout: Duration,
	stop_timeout: Duration,
}

impl AccountManager {
	/// Start the manager task. The first reconciliation pass runs immediately.
	pub fn start(store: Arc<dyn MessageStore>, factory: Arc<dyn AdapterFactory>, cfg: AccountManagerConfig) -> Self {
		let (requests_tx, requests_rx) = mpsc::channel(16);
		let (incoming_tx, incoming_rx) = mpsc::channel(cfg.incoming_capacity.max(1));
		let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
		let shutdown = CancellationToken::new();
		let exited = CancellationToken::new();

		let request_timeout = cfg.request_timeout;
		let stop_timeout = cfg.stop_timeout;

		let worker = ManagerLoop {
			store,
			factory,
			cfg,
			clients: HashMap::new(),
			incoming_tx,
			incoming_rx,
			requests_rx,
			fatal_tx,
			fatal_rx,
			shutdown: shutdown.clone(),
		};

		let guard = exited.clone().drop_guard();
		let task = tokio::spawn(async move {
			let _guard = guard;
			worker.run().await
		});

		Self {
			requests_tx,
			shutdown,
			exited,
			lifecycle: Mutex::new(Lifecycle::Running(task)),
			request_timeout,
			stop_timeout,
		}
	}

	/// Run a reconciliation pass now and wait for it to finish.
	pub async fn refresh(&self) -> Result<(), ManagerError> {
		self.call("refresh", |resp| ManagerRequest::Refresh { resp }).await
	}

	/// Accounts that currently have a registered client, sorted by name.
	pub async fn registered_accounts(&self) -> Result<Vec<AccountName>, ManagerError> {
		self.call("query", |resp| ManagerRequest::Accounts { resp }).await
	}

	async fn call<T>(
		&self,
		op: &'static str,
		make: impl FnOnce(oneshot::Sender<T>) -> ManagerRequest,
	) -> Result<T, ManagerError> {
		if self.shutdown.is_cancelled() || self.exited.is_cancelled() {
			return Err(ManagerError::Stopped);
		}

		let (tx, rx) = oneshot::channel();
		let exchange = async {
			self.requests_tx.send(make(tx)).await.map_err(|_| ManagerError::Stopped)?;
			rx.await.map_err(|_| ManagerError::Stopped)
		};

		match timeout(self.request_timeout, exchange).await {
			Ok(res) => res,
			Err(_) => Err(ManagerError::Timeout(op)),
		}
	}

	/// Resolves once the manager task has exited, for whatever reason.
	pub async fn stopped(&self) {
		self.exited.cancelled().await;
	}

	/// Stop every client and the manager task. Reports a fatal error if one ended the manager. Idempotent.
	pub async fn stop(&self) -> Result<(), ManagerError> {
		self.shutdown.cancel();

		let mut lifecycle = self.lifecycle.lock().await;
		let outcome = match &mut *lifecycle {
			Lifecycle::Finished(outcome) => return outcome.clone(),
			Lifecycle::Running(task) => match timeout(self.stop_timeout, &mut *task).await {
				Ok(Ok(outcome)) => outcome,
				Ok(Err(_)) => Err(ManagerError::Panicked),
				Err(_) => {
					warn!(timeout_ms = self.stop_timeout.as_millis(), "account manager did not stop in time; aborting");
					task.abort();
					Err(ManagerError::Timeout("stop"))
				}
			},
		};

		*lifecycle = Lifecycle::Finished(outcome.clone());
		outcome
	}
}

impl Drop for AccountManager {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

struct RunningClient {
	client: AccountClient,
	tailer: JoinHandle<()>,
}

impl RunningClient {
	async fn stop(self) {
		let account = self.client.account_name().clone();
		if let Err(e) = self.client.stop().await {
			warn!(%account, error = %e, "account client stop failed");
		}
		if let Err(e) = self.tailer.await
			&& e.is_panic()
		{
			warn!(%account, "tailer panicked");
		}
	}
}

struct ManagerLoop {
	store: Arc<dyn MessageStore>,
	factory: Arc<dyn AdapterFactory>,
	cfg: AccountManagerConfig,
	clients: HashMap<AccountName, RunningClient>,
	incoming_tx: mpsc::Sender<Message>,
	incoming_rx: mpsc::Receiver<Message>,
	requests_rx: mpsc::Receiver<ManagerRequest>,
	fatal_tx: mpsc::UnboundedSender<ManagerError>,
	fatal_rx: mpsc::UnboundedReceiver<ManagerError>,
	shutdown: CancellationToken,
}

impl ManagerLoop {
	async fn run(mut self) -> Result<(), ManagerError> {
		info!("account manager started");
		self.refresh().await;

		let mut ticker = tokio::time::interval_at(Instant::now() + self.cfg.refresh_interval, self.cfg.refresh_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		let outcome = loop {
			tokio::select! {
				biased;

				_ = self.shutdown.cancelled() => {
					info!("account manager stopping");
					break Ok(());
				}

				Some(err) = self.fatal_rx.recv() => {
					warn!(error = %err, "account manager stopping on fatal error");
					break Err(err);
				}

				Some(msg) = self.incoming_rx.recv() => {
					persist_incoming(self.store.as_ref(), msg).await;
				}

				Some(req) = self.requests_rx.recv() => match req {
					ManagerRequest::Refresh { resp } => {
						self.refresh().await;
						let _ = resp.send(());
					}
					ManagerRequest::Accounts { resp } => {
						let mut names: Vec<AccountName> = self.clients.keys().cloned().collect();
						names.sort();
						let _ = resp.send(names);
					}
				},

				_ = ticker.tick() => {
					self.refresh().await;
				}
			}
		};

		// Clients are children of this token; a fatal stop must take them down as well.
		self.shutdown.cancel();
		let clients: Vec<RunningClient> = self.clients.drain().map(|(_, rc)| rc).collect();
		self.stop_clients(clients).await;
		metrics::gauge!("relay_manager_clients").set(0.0);
		info!("account manager stopped");

		outcome
	}

	/// Reconcile the client registry with the stored account configuration.
	async fn refresh(&mut self) {
		metrics::counter!("relay_manager_refresh_total").increment(1);

		let snapshot = match self.store.read_account_config().await {
			Ok(snapshot) => snapshot,
			Err(e) => {
				metrics::counter!("relay_manager_refresh_errors_total").increment(1);
				warn!(error = %e, "failed to read account configuration; keeping current clients");
				return;
			}
		};

		let good: HashMap<AccountName, AccountInfo> = snapshot
			.into_iter()
			.filter(|info| self.cfg.allows(info))
			.map(|info| (info.name.clone(), info))
			.collect();

		let retired: Vec<AccountName> = self
			.clients
			.iter()
			.filter(|(name, rc)| !good.contains_key(*name) || !rc.client.alive())
			.map(|(name, _)| name.clone())
			.collect();

		let mut stopping = Vec::with_capacity(retired.len());
		for name in retired {
			if let Some(rc) = self.clients.remove(&name) {
				if good.contains_key(&name) {
					info!(account = %name, "account client died; restarting");
				} else {
					info!(account = %name, "account no longer active; stopping client");
				}
				stopping.push(rc);
			}
		}
		self.stop_clients(stopping).await;

		let mut fresh = Vec::new();
		let outcomes = {
			let mut updates = Vec::new();
			for (name, info) in good {
				match self.clients.get(&name) {
					Some(rc) => updates.push(async move { (name, rc.client.update_info(info).await) }),
					None => fresh.push(info),
				}
			}

			// Clients may be blocked on a full incoming channel while their update is pending.
			let updates = join_all(updates);
			tokio::pin!(updates);
			loop {
				tokio::select! {
					results = &mut updates => break results,
					Some(msg) = self.incoming_rx.recv() => {
						persist_incoming(self.store.as_ref(), msg).await;
					}
				}
			}
		};
		for (name, res) in outcomes {
			if let Err(e) = res {
				warn!(account = %name, error = %e, "failed to update account client");
			}
		}

		for info in fresh {
			self.start_client(info).await;
		}

		metrics::gauge!("relay_manager_clients").set(self.clients.len() as f64);
		debug!(clients = self.clients.len(), "refresh pass complete");
	}

	async fn start_client(&mut self, mut info: AccountInfo) {
		let name = info.name.clone();

		// Backlog that predates the first activation is never replayed.
		if info.last_id.is_zero() {
			let max = match self.store.max_id().await {
				Ok(max) => max,
				Err(e) => {
					warn!(account = %name, error = %e, "failed to read max message id; not starting client");
					return;
				}
			};
			// No client runs until its starting cursor is stored.
			if let Err(e) = self.store.update_cursor(&name, max).await {
				warn!(account = %name, error = %e, "failed to persist initial cursor; not starting client");
				return;
			}
			info.last_id = max;
		}

		let cursor = info.last_id;
		let client = match AccountClient::start(
			self.factory.as_ref(),
			info,
			self.incoming_tx.clone(),
			&self.shutdown,
			self.cfg.client.clone(),
		) {
			Ok(client) => client,
			Err(e) => {
				metrics::counter!("relay_manager_client_start_errors_total").increment(1);
				warn!(account = %name, error = %e, "failed to start account client");
				return;
			}
		};

		let tailer = Tailer {
			store: Arc::clone(&self.store),
			account: name.clone(),
			cursor,
			outgoing: client.outgoing(),
			dying: client.dying(),
			poll_delay: self.cfg.poll_delay,
			batch: self.cfg.tail_batch,
			fatal_tx: self.fatal_tx.clone(),
		}
		.spawn();

		info!(account = %name, kind = %client.kind(), %cursor, "account client registered");
		self.clients.insert(name, RunningClient { client, tailer });
	}

	/// Stop `clients` while persisting whatever they still push, so a client blocked on a full
	/// incoming channel can finish.
	async fn stop_clients(&mut self, clients: Vec<RunningClient>) {
		if clients.is_empty() {
			return;
		}

		let stops = join_all(clients.into_iter().map(RunningClient::stop));
		tokio::pin!(stops);

		loop {
			tokio::select! {
				_ = &mut stops => break,
				Some(msg) = self.incoming_rx.recv() => {
					persist_incoming(self.store.as_ref(), msg).await;
				}
			}
		}

		while let Ok(msg) = self.incoming_rx.try_recv() {
			persist_incoming(self.store.as_ref(), msg).await;
		}
	}
}

/// Record one message pushed by a client. Acknowledgments move the account cursor instead.
pub(crate) async fn persist_incoming(store: &dyn MessageStore, msg: Message) {
	match msg.ack_id() {
		Some(Ok(id)) => {
			if let Err(e) = store.update_cursor(&msg.account, id).await {
				warn!(account = %msg.account, %id, error = %e, "failed to persist acknowledged cursor");
			} else {
				debug!(account = %msg.account, %id, "cursor acknowledged");
			}
		}
		Some(Err(e)) => {
			metrics::counter!("relay_incoming_malformed_acks_total").increment(1);
			warn!(account = %msg.account, error = %e, text = %msg.text, "ignoring malformed acknowledgment");
		}
		None => match store.insert(&msg).await {
			Ok(id) => {
				metrics::counter!("relay_incoming_persisted_total").increment(1);
				debug!(account = %msg.account, %id, "incoming message persisted");
			}
			Err(e) if e.is_duplicate() => {
				debug!(account = %msg.account, "incoming message already recorded");
			}
			Err(e) => {
				metrics::counter!("relay_incoming_persist_errors_total").increment(1);
				warn!(account = %msg.account, error = %e, "failed to persist incoming message");
			}
		},
	}
}
