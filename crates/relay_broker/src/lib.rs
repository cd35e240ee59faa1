#![forbid(unsafe_code)]

//! Shared access to a single fragile connection.
//!
//! A [`ConnectionBroker`] owns one physical connection produced by a [`Connector`] and serves
//! requests from any number of [`BrokerHandle`]s, one at a time. The broker task redials with a
//! fixed backoff whenever the connection fails and keeps running until the broker and every
//! handle have been closed.

mod broker;
pub mod directory;

use thiserror::Error;

pub use broker::{BrokerConfig, BrokerHandle, ConnectionBroker};

/// Errors surfaced to broker callers. These are user-facing diagnostics, not raw transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
	/// The handle was closed before the request was issued.
	#[error("connection already closed")]
	Closed,

	/// The request timed out and no connection error is known.
	#[error("service is currently slow, try again later")]
	Sluggish,

	/// The request timed out while the service was failing.
	#[error("service unavailable: {0}")]
	Unavailable(String),

	/// The request reached the service and failed there.
	#[error("request failed: {0}")]
	Request(String),
}

/// Dials and speaks to the external service. Only the broker task ever touches `Conn`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
	type Conn: Send + 'static;
	type Request: Send + 'static;
	type Response: Send + 'static;

	/// Service name for logs and metrics.
	fn name(&self) -> &str;

	async fn dial(&self) -> anyhow::Result<Self::Conn>;

	/// Perform one request. An error means the connection is no longer usable.
	async fn request(&self, conn: &mut Self::Conn, req: Self::Request) -> anyhow::Result<Self::Response>;

	/// Cheap liveness probe issued after an idle period.
	async fn ping(&self, conn: &mut Self::Conn) -> anyhow::Result<()>;

	async fn close(&self, conn: Self::Conn) {
		drop(conn);
	}
}
