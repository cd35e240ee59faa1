#![forbid(unsafe_code)]

mod loopback;

use relay_domain::{AccountInfo, AccountKind, Message};
use relay_platform::{AccountAdapter, AdapterFactory, ClientError};
use tokio::sync::mpsc;

pub use loopback::LoopbackAdapter;

/// Adapters available in this build. Kinds without a transport are rejected per account.
#[derive(Debug, Clone, Default)]
pub struct DefaultAdapterFactory {
	loopback_wire: Option<mpsc::UnboundedSender<Message>>,
}

impl DefaultAdapterFactory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Send everything loopback accounts transmit to `wire`.
	#[cfg(test)]
	pub fn with_loopback_wire(mut self, wire: mpsc::UnboundedSender<Message>) -> Self {
		self.loopback_wire = Some(wire);
		self
	}
}

impl AdapterFactory for DefaultAdapterFactory {
	fn build(&self, info: &AccountInfo) -> Result<Box<dyn AccountAdapter>, ClientError> {
		match info.kind {
			AccountKind::Loopback => Ok(Box::new(LoopbackAdapter::new(self.loopback_wire.clone()))),
			kind @ (AccountKind::Irc | AccountKind::Telegram | AccountKind::Webhook) => {
				Err(ClientError::UnsupportedKind(kind))
			}
		}
	}
}
