#![forbid(unsafe_code)]

//! Directory-service client built on [`ConnectionBroker`].
//!
//! The service speaks newline-delimited JSON over TCP: one request object per line, answered by
//! exactly one response object per line.

use std::collections::BTreeMap;

use anyhow::{Context, anyhow};
use relay_util::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{BrokerHandle, ConnectionBroker, Connector};

pub type DirectoryBroker = ConnectionBroker<DirectoryConnector>;
pub type DirectoryHandle = BrokerHandle<DirectoryConnector>;

/// Operation name of the keepalive probe.
pub const PING_OP: &str = "ping";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRequest {
	pub op: String,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub attrs: BTreeMap<String, String>,
}

impl DirectoryRequest {
	pub fn new(op: impl Into<String>) -> Self {
		Self {
			op: op.into(),
			attrs: BTreeMap::new(),
		}
	}

	pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.attrs.insert(key.into(), value.into());
		self
	}

	pub fn ping() -> Self {
		Self::new(PING_OP)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryResponse {
	pub ok: bool,
	#[serde(default)]
	pub entries: Vec<BTreeMap<String, String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

pub struct DirectoryConn {
	reader: BufReader<OwnedReadHalf>,
	writer: OwnedWriteHalf,
	line: String,
}

impl DirectoryConn {
	async fn exchange(&mut self, req: &DirectoryRequest) -> anyhow::Result<DirectoryResponse> {
		let mut frame = serde_json::to_vec(req).context("encode directory request")?;
		frame.push(b'\n');
		self.writer.write_all(&frame).await.context("write directory request")?;
		self.writer.flush().await.context("flush directory request")?;

		self.line.clear();
		let n = self
			.reader
			.read_line(&mut self.line)
			.await
			.context("read directory response")?;
		if n == 0 {
			return Err(anyhow!("directory service closed the connection"));
		}
		serde_json::from_str(self.line.trim_end()).context("decode directory response")
	}
}

/// Connector for a directory service at `tcp://host:port`.
#[derive(Debug, Clone)]
pub struct DirectoryConnector {
	endpoint: Endpoint,
	name: String,
}

impl DirectoryConnector {
	pub fn new(endpoint: &str) -> anyhow::Result<Self> {
		let endpoint = Endpoint::parse_with_scheme(endpoint, "tcp").map_err(|e| anyhow!("directory endpoint: {e}"))?;
		let name = format!("directory@{}", endpoint.hostport());
		Ok(Self { endpoint, name })
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}
}

#[async_trait::async_trait]
impl Connector for DirectoryConnector {
	type Conn = DirectoryConn;
	type Request = DirectoryRequest;
	type Response = DirectoryResponse;

	fn name(&self) -> &str {
		&self.name
	}

	async fn dial(&self) -> anyhow::Result<DirectoryConn> {
		let hostport = self.endpoint.hostport();
		let stream = TcpStream::connect(&hostport)
			.await
			.with_context(|| format!("connect to directory service at {hostport}"))?;
		stream.set_nodelay(true).ok();
		let (read, write) = stream.into_split();
		Ok(DirectoryConn {
			reader: BufReader::new(read),
			writer: write,
			line: String::new(),
		})
	}

	async fn request(&self, conn: &mut DirectoryConn, req: DirectoryRequest) -> anyhow::Result<DirectoryResponse> {
		conn.exchange(&req).await
	}

	async fn ping(&self, conn: &mut DirectoryConn) -> anyhow::Result<()> {
		let resp = conn.exchange(&DirectoryRequest::ping()).await?;
		if !resp.ok {
			return Err(anyhow!(
				"directory ping rejected: {}",
				resp.error.unwrap_or_else(|| "no reason given".to_string())
			));
		}
		Ok(())
	}

	async fn close(&self, mut conn: DirectoryConn) {
		let _ = conn.writer.shutdown().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_non_tcp_endpoints() {
		assert!(DirectoryConnector::new("udp://127.0.0.1:389").is_err());
		assert!(DirectoryConnector::new("127.0.0.1:389").is_err());

		let c = DirectoryConnector::new("tcp://dir.local:7000").unwrap();
		assert_eq!(c.name(), "directory@dir.local:7000");
	}

	#[test]
	fn request_wire_shape() {
		let req = DirectoryRequest::new("lookup").attr("uid", "alice");
		assert_eq!(
			serde_json::to_string(&req).unwrap(),
			r#"{"op":"lookup","attrs":{"uid":"alice"}}"#
		);
		assert_eq!(serde_json::to_string(&DirectoryRequest::ping()).unwrap(), r#"{"op":"ping"}"#);

		let resp: DirectoryResponse = serde_json::from_str(r#"{"ok":false,"error":"no such entry"}"#).unwrap();
		assert!(!resp.ok);
		assert!(resp.entries.is_empty());
		assert_eq!(resp.error.as_deref(), Some("no such entry"));
	}
}
