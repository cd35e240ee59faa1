#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::{BrokerError, Connector};

/// Broker timing configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
	/// Upper bound for a caller waiting on a request (queueing included).
	pub request_timeout: Duration,
	pub dial_timeout: Duration,
	/// Idle period after which the connection is probed.
	pub keepalive_interval: Duration,
	/// Delay between failed dials.
	pub backoff: Duration,
}

impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			request_timeout: Duration::from_secs(5),
			dial_timeout: Duration::from_secs(10),
			keepalive_interval: Duration::from_secs(60),
			backoff: Duration::from_secs(5),
		}
	}
}

#[derive(Debug)]
enum Control {
	Acquire,
	Release,
	RefCount { resp: oneshot::Sender<usize> },
}

struct Pending<C: Connector> {
	req: C::Request,
	reply: oneshot::Sender<anyhow::Result<C::Response>>,
}

/// Last connection error, kept for diagnostics only.
#[derive(Debug, Default)]
struct Diagnostics {
	last_error: parking_lot::Mutex<Option<String>>,
}

impl Diagnostics {
	fn record(&self, err: String) {
		*self.last_error.lock() = Some(err);
	}

	fn clear(&self) {
		*self.last_error.lock() = None;
	}

	fn last_error(&self) -> Option<String> {
		self.last_error.lock().clone()
	}

	fn timed_out(&self) -> BrokerError {
		match self.last_error() {
			Some(e) => BrokerError::Unavailable(e),
			None => BrokerError::Sluggish,
		}
	}
}

/// Owner of the shared connection. Holds one reference of its own until [`ConnectionBroker::close`].
pub struct ConnectionBroker<C: Connector> {
	control_tx: mpsc::UnboundedSender<Control>,
	request_tx: mpsc::Sender<Pending<C>>,
	diag: Arc<Diagnostics>,
	closed: AtomicBool,
	request_timeout: Duration,
}

impl<C: Connector> ConnectionBroker<C> {
	/// Spawn the broker task. The first dial starts immediately.
	pub fn start(connector: C, cfg: BrokerConfig) -> Self {
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		// One slot: at most one request waits while another is in flight.
		let (request_tx, request_rx) = mpsc::channel(1);
		let diag = Arc::new(Diagnostics::default());
		let request_timeout = cfg.request_timeout;

		let worker = BrokerLoop {
			connector,
			cfg,
			control_rx,
			request_rx,
			diag: Arc::clone(&diag),
			refs: 1,
		};
		tokio::spawn(worker.run());

		Self {
			control_tx,
			request_tx,
			diag,
			closed: AtomicBool::new(false),
			request_timeout,
		}
	}

	/// Issue a new logical handle.
	///
	/// # Panics
	///
	/// When called after [`ConnectionBroker::close`], or after the broker task has exited.
	pub fn acquire(&self) -> BrokerHandle<C> {
		if self.closed.load(Ordering::Acquire) {
			panic!("connection broker: acquire after close");
		}
		if self.control_tx.send(Control::Acquire).is_err() {
			panic!("connection broker: acquire after the broker task exited");
		}
		BrokerHandle {
			control_tx: self.control_tx.clone(),
			request_tx: self.request_tx.clone(),
			diag: Arc::clone(&self.diag),
			closed: AtomicBool::new(false),
			request_timeout: self.request_timeout,
		}
	}

	/// Release the broker's own reference. Idempotent.
	pub fn close(&self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			let _ = self.control_tx.send(Control::Release);
		}
	}

	/// Last dial or connection error, if the service is currently failing.
	pub fn last_error(&self) -> Option<String> {
		self.diag.last_error()
	}

	/// Reference count as seen by the broker task, after every acquire/release issued so far.
	pub async fn ref_count(&self) -> Option<usize> {
		let (tx, rx) = oneshot::channel();
		self.control_tx.send(Control::RefCount { resp: tx }).ok()?;
		timeout(self.request_timeout, rx).await.ok()?.ok()
	}
}

impl<C: Connector> Drop for ConnectionBroker<C> {
	fn drop(&mut self) {
		self.close();
	}
}

/// Logical connection issued by [`ConnectionBroker::acquire`]. Closed on drop.
pub struct BrokerHandle<C: Connector> {
	control_tx: mpsc::UnboundedSender<Control>,
	request_tx: mpsc::Sender<Pending<C>>,
	diag: Arc<Diagnostics>,
	closed: AtomicBool,
	request_timeout: Duration,
}

impl<C: Connector> BrokerHandle<C> {
	/// Send `req` through the shared connection, waiting at most the configured request timeout.
	pub async fn request(&self, req: C::Request) -> Result<C::Response, BrokerError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(BrokerError::Closed);
		}

		let (reply_tx, reply_rx) = oneshot::channel();
		let exchange = async {
			self.request_tx
				.send(Pending { req, reply: reply_tx })
				.await
				.map_err(|_| self.diag.timed_out())?;
			reply_rx.await.map_err(|_| self.diag.timed_out())
		};

		match timeout(self.request_timeout, exchange).await {
			Ok(Ok(Ok(resp))) => Ok(resp),
			Ok(Ok(Err(e))) => Err(BrokerError::Request(format!("{e:#}"))),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(self.diag.timed_out()),
		}
	}

	/// Release this handle's reference. Idempotent.
	pub fn close(&self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			let _ = self.control_tx.send(Control::Release);
		}
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

impl<C: Connector> Drop for BrokerHandle<C> {
	fn drop(&mut self) {
		self.close();
	}
}

struct BrokerLoop<C: Connector> {
	connector: C,
	cfg: BrokerConfig,
	control_rx: mpsc::UnboundedReceiver<Control>,
	request_rx: mpsc::Receiver<Pending<C>>,
	diag: Arc<Diagnostics>,
	refs: usize,
}

impl<C: Connector> BrokerLoop<C> {
	async fn run(mut self) {
		let service = self.connector.name().to_string();
		debug!(%service, "connection broker started");

		while self.refs > 0 {
			let dialed = match timeout(self.cfg.dial_timeout, self.connector.dial()).await {
				Ok(res) => res,
				Err(_) => Err(anyhow!("dial timed out after {:?}", self.cfg.dial_timeout)),
			};

			match dialed {
				Ok(conn) => {
					self.diag.clear();
					metrics::counter!("relay_broker_connects_total", "service" => service.clone()).increment(1);
					info!(%service, "connection established");
					self.serve(conn, &service).await;
				}
				Err(e) => {
					metrics::counter!("relay_broker_dial_failures_total", "service" => service.clone()).increment(1);
					warn!(%service, error = %format!("{e:#}"), backoff_ms = self.cfg.backoff.as_millis(), "dial failed");
					self.diag.record(format!("{e:#}"));
					self.backoff().await;
				}
			}
		}

		debug!(%service, "connection broker exiting (no references left)");
	}

	fn apply(&mut self, ev: Option<Control>) {
		match ev {
			Some(Control::Acquire) => self.refs += 1,
			Some(Control::Release) => self.refs = self.refs.saturating_sub(1),
			Some(Control::RefCount { resp }) => {
				let _ = resp.send(self.refs);
			}
			// Every sender is gone, so every reference has been released.
			None => self.refs = 0,
		}
	}

	/// Wait out the backoff while keeping reference counting live.
	async fn backoff(&mut self) {
		let sleep = tokio::time::sleep(self.cfg.backoff);
		tokio::pin!(sleep);

		while self.refs > 0 {
			tokio::select! {
				_ = &mut sleep => return,
				ev = self.control_rx.recv() => self.apply(ev),
			}
		}
	}

	async fn serve(&mut self, mut conn: C::Conn, service: &str) {
		let idle = tokio::time::sleep(self.cfg.keepalive_interval);
		tokio::pin!(idle);

		loop {
			tokio::select! {
				pending = self.request_rx.recv() => {
					let Some(pending) = pending else {
						break;
					};
					if pending.reply.is_closed() {
						debug!(%service, "caller gave up before the request was served; skipping");
					} else {
						let res = match timeout(self.cfg.request_timeout, self.connector.request(&mut conn, pending.req)).await {
							Ok(res) => res,
							Err(_) => Err(anyhow!("request timed out after {:?}", self.cfg.request_timeout)),
						};
						let failure = res.as_ref().err().map(|e| format!("{e:#}"));
						let _ = pending.reply.send(res);
						if let Some(err) = failure {
							warn!(%service, error = %err, "request failed; dropping connection");
							self.diag.record(err);
							break;
						}
						idle.as_mut().reset(Instant::now() + self.cfg.keepalive_interval);
					}
				}

				_ = &mut idle => {
					let probe = match timeout(self.cfg.request_timeout, self.connector.ping(&mut conn)).await {
						Ok(res) => res,
						Err(_) => Err(anyhow!("keepalive timed out after {:?}", self.cfg.request_timeout)),
					};
					if let Err(e) = probe {
						warn!(%service, error = %format!("{e:#}"), "keepalive failed; dropping connection");
						self.diag.record(format!("{e:#}"));
						break;
					}
					debug!(%service, "keepalive ok");
					idle.as_mut().reset(Instant::now() + self.cfg.keepalive_interval);
				}

				// Reference churn is not traffic and leaves the keepalive deadline alone.
				ev = self.control_rx.recv() => {
					self.apply(ev);
					if self.refs == 0 {
						break;
					}
				}
			}
		}

		self.connector.close(conn).await;
		debug!(%service, "connection closed");
	}
}
