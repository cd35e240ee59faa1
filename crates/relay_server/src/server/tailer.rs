#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_domain::{AccountName, Lane, Message, MessageId};
use relay_store::MessageStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::server::account_manager::ManagerError;

/// Feeds one account's outgoing lane to its client, strictly in id order.
pub struct Tailer {
	pub store: Arc<dyn MessageStore>,
	pub account: AccountName,
	/// Last id handed to the client.
	pub cursor: MessageId,
	pub outgoing: mpsc::Sender<Message>,
	/// The client's dying signal (a child of the manager's root token).
	pub dying: CancellationToken,
	pub poll_delay: Duration,
	pub batch: usize,
	pub fatal_tx: mpsc::UnboundedSender<ManagerError>,
}

impl Tailer {
	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(self.run())
	}

	async fn run(mut self) {
		let batch = self.batch.max(1);
		debug!(account = %self.account, cursor = %self.cursor, "tailer started");

		while !self.dying.is_cancelled() {
			let rows = match self.store.query(&self.account, Lane::Outgoing, self.cursor, batch).await {
				Ok(rows) => rows,
				Err(e) => {
					metrics::counter!("relay_tailer_query_errors_total").increment(1);
					warn!(account = %self.account, cursor = %self.cursor, error = %e, "outgoing query failed; retrying");
					if !self.pause().await {
						break;
					}
					continue;
				}
			};

			let exhausted = rows.len() < batch;
			for msg in rows {
				if !self.deliver(msg).await {
					debug!(account = %self.account, cursor = %self.cursor, "tailer exiting");
					return;
				}
			}

			if exhausted && !self.pause().await {
				break;
			}
		}

		debug!(account = %self.account, cursor = %self.cursor, "tailer exiting");
	}

	/// Hand `msg` to the client, then record its echo. False when the tailer must exit.
	async fn deliver(&mut self, msg: Message) -> bool {
		let id = msg.id;
		let echo = msg.echo();

		tokio::select! {
			biased;
			_ = self.dying.cancelled() => return false,
			sent = self.outgoing.send(msg) => {
				if sent.is_err() {
					return false;
				}
			}
		}

		match self.store.insert(&echo).await {
			Ok(_) => {}
			Err(e) if e.is_duplicate() => {
				debug!(account = %self.account, %id, "echo already recorded");
			}
			Err(e) => {
				error!(account = %self.account, %id, error = %e, "echo insert failed after handoff");
				let _ = self.fatal_tx.send(ManagerError::Durability {
					account: self.account.clone(),
					id,
					reason: e.to_string(),
				});
				return false;
			}
		}

		self.cursor = id;
		metrics::counter!("relay_tailer_delivered_total").increment(1);
		true
	}

	/// Sleep the poll delay unless the client dies first.
	async fn pause(&self) -> bool {
		tokio::select! {
			_ = self.dying.cancelled() => false,
			_ = tokio::time::sleep(self.poll_delay) => true,
		}
	}
}
