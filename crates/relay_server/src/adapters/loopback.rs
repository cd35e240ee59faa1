#![forbid(unsafe_code)]

use async_trait::async_trait;
use relay_domain::{AccountKind, Lane, Message};
use relay_platform::{AccountAdapter, ClientContext, ClientControl};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// In-process transport: "transmits" to an optional wire and acknowledges every message.
pub struct LoopbackAdapter {
	wire: Option<mpsc::UnboundedSender<Message>>,
	feed: Option<mpsc::Receiver<Message>>,
}

impl LoopbackAdapter {
	pub fn new(wire: Option<mpsc::UnboundedSender<Message>>) -> Self {
		Self { wire, feed: None }
	}

	/// Treat messages from `feed` as traffic received from the network.
	#[cfg(test)]
	pub fn with_feed(mut self, feed: mpsc::Receiver<Message>) -> Self {
		self.feed = Some(feed);
		self
	}
}

async fn next_inbound(feed: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
	match feed {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}

#[async_trait]
impl AccountAdapter for LoopbackAdapter {
	fn kind(&self) -> AccountKind {
		AccountKind::Loopback
	}

	async fn run(self: Box<Self>, mut ctx: ClientContext) -> anyhow::Result<()> {
		let LoopbackAdapter { mut wire, mut feed } = *self;
		let account = ctx.account.clone();
		info!(%account, channels = ctx.info.channels.len(), last_id = %ctx.last_id.get(), "loopback adapter online");

		loop {
			tokio::select! {
				biased;

				_ = ctx.dying.cancelled() => break,

				ctl = ctx.control_rx.recv() => {
					let Some(ClientControl::UpdateInfo { info, resp }) = ctl else {
						break;
					};
					if info.channels != ctx.info.channels {
						debug!(%account, channels = info.channels.len(), "loopback channel set changed");
					}
					ctx.info = *info;
					let _ = resp.send(Ok(()));
				}

				out = ctx.outgoing_rx.recv() => {
					let Some(msg) = out else {
						break;
					};
					let id = msg.id;
					if let Some(tx) = &wire
						&& tx.send(msg).is_err()
					{
						warn!(%account, "loopback wire closed; further messages are discarded");
						wire = None;
					}
					ctx.transmitted(id).await?;
				}

				inbound = next_inbound(&mut feed) => match inbound {
					Some(mut msg) => {
						msg.lane = Lane::Incoming;
						msg.account = account.clone();
						ctx.emit(msg).await?;
					}
					None => {
						debug!(%account, "loopback feed closed");
						feed = None;
					}
				},
			}
		}

		info!(%account, "loopback adapter offline");
		Ok(())
	}
}
