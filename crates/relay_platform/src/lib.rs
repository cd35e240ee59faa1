#![forbid(unsafe_code)]

//! Per-account client plumbing.
//!
//! An [`AccountAdapter`] owns the network side of one account and runs inside a task supervised
//! by an [`AccountClient`]. The client exposes liveness, the outgoing-delivery channel, the
//! dying signal and configuration updates; the adapter sees the other ends through
//! [`ClientContext`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use relay_domain::{AccountInfo, AccountKind, AccountName, Message, MessageId};
use relay_util::time::unix_ms_now;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use relay_domain::SecretString;

/// Manager → adapter control message.
#[derive(Debug)]
pub enum ClientControl {
	/// Apply a new configuration snapshot. The adapter answers once applied (or rejected).
	UpdateInfo {
		info: Box<AccountInfo>,
		resp: oneshot::Sender<Result<(), String>>,
	},
}

pub type ClientControlTx = mpsc::Sender<ClientControl>;
pub type ClientControlRx = mpsc::Receiver<ClientControl>;

/// Account client errors.
#[derive(Debug, Error)]
pub enum ClientError {
	#[error("unsupported account kind: {0}")]
	UnsupportedKind(AccountKind),

	#[error("account {account}: {reason}")]
	Build { account: AccountName, reason: String },

	#[error("configuration is for account {got}, client serves {expected}")]
	AccountMismatch { expected: AccountName, got: AccountName },

	#[error("client is not running")]
	Gone,

	#[error("client did not answer within {0:?}")]
	Timeout(Duration),

	#[error("configuration rejected: {0}")]
	Rejected(String),

	#[error("client did not stop within {0:?}; task aborted")]
	StopTimeout(Duration),

	#[error("client task panicked")]
	Panicked,
}

/// Highest outgoing id the transport has handed to the network.
#[derive(Debug, Clone, Default)]
pub struct LastIdTracker(Arc<AtomicI64>);

impl LastIdTracker {
	pub fn new(initial: MessageId) -> Self {
		Self(Arc::new(AtomicI64::new(initial.get())))
	}

	/// Record a transmitted id; never moves backwards.
	pub fn record(&self, id: MessageId) {
		self.0.fetch_max(id.get(), Ordering::AcqRel);
	}

	pub fn get(&self) -> MessageId {
		MessageId(self.0.load(Ordering::Acquire))
	}
}

/// Everything an adapter works with while running.
pub struct ClientContext {
	pub account: AccountName,
	pub info: AccountInfo,
	pub control_rx: ClientControlRx,
	/// Messages to transmit, in delivery order.
	pub outgoing_rx: mpsc::Receiver<Message>,
	pub incoming_tx: mpsc::Sender<Message>,
	pub last_id: LastIdTracker,
	/// Cancelled when the client must stop (or once the adapter has returned).
	pub dying: CancellationToken,
}

impl ClientContext {
	/// Hand an inbound message to the manager. Waits for room in the incoming channel.
	pub async fn emit(&self, msg: Message) -> anyhow::Result<()> {
		self.incoming_tx
			.send(msg)
			.await
			.map_err(|_| anyhow::anyhow!("incoming channel closed"))
	}

	/// Mark `id` as transmitted and acknowledge it to the manager.
	pub async fn transmitted(&self, id: MessageId) -> anyhow::Result<()> {
		self.last_id.record(id);
		self.emit(Message::ack(self.account.clone(), id, unix_ms_now())).await
	}
}

/// Network side of one account.
#[async_trait::async_trait]
pub trait AccountAdapter: Send + 'static {
	fn kind(&self) -> AccountKind;

	/// Run until `ctx.dying` is cancelled or the connection fails for good.
	async fn run(self: Box<Self>, ctx: ClientContext) -> anyhow::Result<()>;
}

/// Builds the adapter for an account's kind.
pub trait AdapterFactory: Send + Sync + 'static {
	fn build(&self, info: &AccountInfo) -> Result<Box<dyn AccountAdapter>, ClientError>;
}

/// Client channel sizes and timeouts.
#[derive(Debug, Clone)]
pub struct ClientSettings {
	pub outgoing_capacity: usize,
	pub control_capacity: usize,
	/// Bound for `update_info` (send and answer).
	pub control_timeout: Duration,
	/// How long `stop` waits for the adapter before aborting it.
	pub stop_timeout: Duration,
}

impl Default for ClientSettings {
	fn default() -> Self {
		Self {
			outgoing_capacity: 1,
			control_capacity: 8,
			control_timeout: Duration::from_secs(5),
			stop_timeout: Duration::from_secs(10),
		}
	}
}

/// Running client for one account.
pub struct AccountClient {
	account: AccountName,
	kind: AccountKind,
	control_tx: ClientControlTx,
	outgoing_tx: mpsc::Sender<Message>,
	last_id: LastIdTracker,
	dying: CancellationToken,
	task: JoinHandle<()>,
	settings: ClientSettings,
}

impl AccountClient {
	/// Build the adapter for `info` and start it.
	pub fn start(
		factory: &dyn AdapterFactory,
		info: AccountInfo,
		incoming_tx: mpsc::Sender<Message>,
		parent: &CancellationToken,
		settings: ClientSettings,
	) -> Result<Self, ClientError> {
		let adapter = factory.build(&info)?;
		Ok(Self::spawn(adapter, info, incoming_tx, parent, settings))
	}

	/// Start `adapter` under a child of `parent`.
	pub fn spawn(
		adapter: Box<dyn AccountAdapter>,
		info: AccountInfo,
		incoming_tx: mpsc::Sender<Message>,
		parent: &CancellationToken,
		settings: ClientSettings,
	) -> Self {
		let account = info.name.clone();
		let kind = adapter.kind();
		let (control_tx, control_rx) = mpsc::channel(settings.control_capacity.max(1));
		let (outgoing_tx, outgoing_rx) = mpsc::channel(settings.outgoing_capacity.max(1));
		let last_id = LastIdTracker::new(info.last_id);
		let dying = parent.child_token();

		let ctx = ClientContext {
			account: account.clone(),
			info,
			control_rx,
			outgoing_rx,
			incoming_tx,
			last_id: last_id.clone(),
			dying: dying.clone(),
		};

		let guard = dying.clone().drop_guard();
		let task_account = account.clone();
		let task = tokio::spawn(async move {
			// Whatever way the adapter ends, the client is dying afterwards.
			let _guard = guard;
			info!(account = %task_account, %kind, "account client started");
			match adapter.run(ctx).await {
				Ok(()) => {
					metrics::counter!("relay_client_exits_total", "kind" => kind.as_str(), "result" => "ok").increment(1);
					info!(account = %task_account, "account client stopped");
				}
				Err(e) => {
					metrics::counter!("relay_client_exits_total", "kind" => kind.as_str(), "result" => "error").increment(1);
					warn!(account = %task_account, error = %format!("{e:#}"), "account client failed");
				}
			}
		});

		Self {
			account,
			kind,
			control_tx,
			outgoing_tx,
			last_id,
			dying,
			task,
			settings,
		}
	}

	pub fn account_name(&self) -> &AccountName {
		&self.account
	}

	pub fn kind(&self) -> AccountKind {
		self.kind
	}

	/// True until the adapter has been told to stop or has returned.
	pub fn alive(&self) -> bool {
		!self.dying.is_cancelled() && !self.task.is_finished()
	}

	/// Cancelled when the client is going away.
	pub fn dying(&self) -> CancellationToken {
		self.dying.clone()
	}

	/// Delivery channel towards the network.
	pub fn outgoing(&self) -> mpsc::Sender<Message> {
		self.outgoing_tx.clone()
	}

	/// Highest outgoing id handed to the network so far.
	pub fn last_id(&self) -> MessageId {
		self.last_id.get()
	}

	/// Push a new configuration snapshot to the adapter and wait for it to be applied.
	pub async fn update_info(&self, info: AccountInfo) -> Result<(), ClientError> {
		if info.name != self.account {
			return Err(ClientError::AccountMismatch {
				expected: self.account.clone(),
				got: info.name,
			});
		}
		if !self.alive() {
			return Err(ClientError::Gone);
		}

		let wait = self.settings.control_timeout;
		let (resp_tx, resp_rx) = oneshot::channel();
		let control = ClientControl::UpdateInfo {
			info: Box::new(info),
			resp: resp_tx,
		};

		let exchange = async {
			self.control_tx.send(control).await.map_err(|_| ClientError::Gone)?;
			resp_rx.await.map_err(|_| ClientError::Gone)
		};

		match timeout(wait, exchange).await {
			Ok(Ok(Ok(()))) => {
				debug!(account = %self.account, "configuration updated");
				Ok(())
			}
			Ok(Ok(Err(reason))) => Err(ClientError::Rejected(reason)),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(ClientError::Timeout(wait)),
		}
	}

	/// Signal the adapter to stop and wait for it, aborting it after the stop timeout.
	pub async fn stop(mut self) -> Result<(), ClientError> {
		self.dying.cancel();
		let wait = self.settings.stop_timeout;

		match timeout(wait, &mut self.task).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) if e.is_panic() => {
				warn!(account = %self.account, "account client panicked");
				Err(ClientError::Panicked)
			}
			Ok(Err(_)) => Ok(()),
			Err(_) => {
				warn!(account = %self.account, timeout_ms = wait.as_millis(), "account client ignored stop; aborting");
				self.task.abort();
				Err(ClientError::StopTimeout(wait))
			}
		}
	}
}

impl std::fmt::Debug for AccountClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AccountClient")
			.field("account", &self.account)
			.field("kind", &self.kind)
			.field("alive", &self.alive())
			.field("last_id", &self.last_id())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use relay_domain::Lane;

	use super::*;

	fn info(name: &str) -> AccountInfo {
		AccountInfo::new(AccountName::new(name).unwrap(), AccountKind::Loopback)
	}

	fn quick() -> ClientSettings {
		ClientSettings {
			control_timeout: Duration::from_millis(200),
			stop_timeout: Duration::from_millis(200),
			..ClientSettings::default()
		}
	}

	/// Acknowledges every outgoing message; rejects configurations without a nick.
	struct Acker;

	#[async_trait::async_trait]
	impl AccountAdapter for Acker {
		fn kind(&self) -> AccountKind {
			AccountKind::Loopback
		}

		async fn run(self: Box<Self>, mut ctx: ClientContext) -> anyhow::Result<()> {
			loop {
				tokio::select! {
					_ = ctx.dying.cancelled() => return Ok(()),
					Some(ClientControl::UpdateInfo { info, resp }) = ctx.control_rx.recv() => {
						if info.nick.is_empty() {
							let _ = resp.send(Err("nick required".to_string()));
						} else {
							ctx.info = *info;
							let _ = resp.send(Ok(()));
						}
					}
					Some(msg) = ctx.outgoing_rx.recv() => ctx.transmitted(msg.id).await?,
				}
			}
		}
	}

	struct Failing;

	#[async_trait::async_trait]
	impl AccountAdapter for Failing {
		fn kind(&self) -> AccountKind {
			AccountKind::Irc
		}

		async fn run(self: Box<Self>, _ctx: ClientContext) -> anyhow::Result<()> {
			anyhow::bail!("connection refused")
		}
	}

	struct Stubborn;

	#[async_trait::async_trait]
	impl AccountAdapter for Stubborn {
		fn kind(&self) -> AccountKind {
			AccountKind::Loopback
		}

		async fn run(self: Box<Self>, _ctx: ClientContext) -> anyhow::Result<()> {
			std::future::pending::<()>().await;
			Ok(())
		}
	}

	#[tokio::test]
	async fn delivers_and_acknowledges() {
		let (in_tx, mut in_rx) = mpsc::channel(4);
		let root = CancellationToken::new();
		let client = AccountClient::spawn(Box::new(Acker), info("a"), in_tx, &root, quick());
		assert!(client.alive());
		assert_eq!(client.account_name().as_str(), "a");

		let mut msg = Message::new(Lane::Outgoing, client.account_name().clone(), "#c", "bot", "PRIVMSG", "hi", 0);
		msg.id = MessageId(7);
		client.outgoing().send(msg).await.unwrap();

		let ack = in_rx.recv().await.unwrap();
		assert_eq!(ack.ack_id().unwrap().unwrap(), MessageId(7));
		assert_eq!(client.last_id(), MessageId(7));

		client.stop().await.unwrap();
	}

	#[tokio::test]
	async fn update_info_is_applied_or_rejected() {
		let (in_tx, _in_rx) = mpsc::channel(4);
		let root = CancellationToken::new();
		let client = AccountClient::spawn(Box::new(Acker), info("a"), in_tx, &root, quick());

		let mut next = info("a");
		next.nick = "relaybot".to_string();
		client.update_info(next).await.unwrap();

		let mut bad = info("a");
		bad.nick.clear();
		assert!(matches!(client.update_info(bad).await, Err(ClientError::Rejected(r)) if r == "nick required"));

		assert!(matches!(
			client.update_info(info("b")).await,
			Err(ClientError::AccountMismatch { .. })
		));
	}

	#[tokio::test]
	async fn adapter_failure_marks_client_dying() {
		let (in_tx, _in_rx) = mpsc::channel(4);
		let root = CancellationToken::new();
		let client = AccountClient::spawn(Box::new(Failing), info("a"), in_tx, &root, quick());

		client.dying().cancelled().await;
		assert!(!client.alive());
		assert!(!root.is_cancelled());
		assert!(matches!(client.update_info(info("a")).await, Err(ClientError::Gone)));
		client.stop().await.unwrap();
	}

	#[tokio::test]
	async fn parent_cancellation_reaches_the_client() {
		let (in_tx, _in_rx) = mpsc::channel(4);
		let root = CancellationToken::new();
		let client = AccountClient::spawn(Box::new(Acker), info("a"), in_tx, &root, quick());

		root.cancel();
		client.dying().cancelled().await;
		assert!(!client.alive());
		client.stop().await.unwrap();
	}

	#[tokio::test]
	async fn stubborn_adapter_is_aborted() {
		let (in_tx, _in_rx) = mpsc::channel(4);
		let root = CancellationToken::new();
		let client = AccountClient::spawn(Box::new(Stubborn), info("a"), in_tx, &root, quick());
		assert!(matches!(client.stop().await, Err(ClientError::StopTimeout(_))));
	}

	#[test]
	fn last_id_tracker_is_monotonic() {
		let t = LastIdTracker::new(MessageId(5));
		t.record(MessageId(3));
		assert_eq!(t.get(), MessageId(5));
		t.record(MessageId(9));
		assert_eq!(t.get(), MessageId(9));
	}
}
