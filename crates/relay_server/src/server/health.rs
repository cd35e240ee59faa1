#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_broker::directory::{DirectoryHandle, DirectoryRequest};
use tokio::net::TcpListener;
use tracing::warn;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	directory: Option<Arc<DirectoryHandle>>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			directory: None,
		}
	}

	/// Probe the directory service through `handle` on `/directoryz`.
	pub fn with_directory(mut self, handle: DirectoryHandle) -> Self {
		self.directory = Some(Arc::new(handle));
		self
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Release the directory handle so the broker can shut down.
	pub fn close_directory(&self) {
		if let Some(handle) = &self.directory {
			handle.close();
		}
	}

	async fn directory_status(&self) -> (StatusCode, String) {
		let Some(handle) = &self.directory else {
			return (StatusCode::NOT_FOUND, "directory not configured".to_string());
		};
		match handle.request(DirectoryRequest::ping()).await {
			Ok(resp) if resp.ok => (StatusCode::OK, "ok".to_string()),
			Ok(resp) => (
				StatusCode::SERVICE_UNAVAILABLE,
				resp.error.unwrap_or_else(|| "directory rejected ping".to_string()),
			),
			Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
		}
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	match req.uri().path() {
		"/healthz" => Ok(reply(StatusCode::OK, Bytes::from_static(b"ok"))),
		"/readyz" => {
			if state.is_ready() {
				Ok(reply(StatusCode::OK, Bytes::from_static(b"ready")))
			} else {
				Ok(reply(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")))
			}
		}
		"/directoryz" => {
			let (status, body) = state.directory_status().await;
			Ok(reply(status, body))
		}
		_ => Ok(reply(StatusCode::NOT_FOUND, Bytes::new())),
	}
}
