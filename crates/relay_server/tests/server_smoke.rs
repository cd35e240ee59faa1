#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;

async fn free_addr() -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind("127.0.0.1:0").await?;
	Ok(listener.local_addr()?)
}

fn write_config(health: SocketAddr, extra: &str) -> anyhow::Result<PathBuf> {
	let dir = std::env::temp_dir().join(format!("relay-smoke-{}-{}", std::process::id(), health.port()));
	std::fs::create_dir_all(&dir).context("create temp dir")?;
	let path = dir.join("config.toml");
	let body = format!(
		"[server]\nhealth_bind = \"{health}\"\n\n[store]\ndatabase_url = \"memory:\"\n\n[manager]\npoll_delay_ms = 50\n{extra}"
	);
	std::fs::write(&path, body).context("write config")?;
	Ok(path)
}

/// GET `path` and return the status code and body.
async fn get(addr: SocketAddr, path: &str) -> anyhow::Result<(u16, String)> {
	let mut stream = TcpStream::connect(addr).await?;
	let req = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
	stream.write_all(req.as_bytes()).await?;

	let mut raw = String::new();
	stream.read_to_string(&mut raw).await?;
	let status = raw
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.ok_or_else(|| anyhow!("malformed response: {raw:?}"))?;
	let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
	Ok((status, body))
}

async fn wait_ready(addr: SocketAddr) -> anyhow::Result<()> {
	for _ in 0..100 {
		if let Ok((200, _)) = get(addr, "/readyz").await {
			return Ok(());
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	Err(anyhow!("server never became ready"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_reports_health_and_readiness() -> anyhow::Result<()> {
	let health = free_addr().await?;
	let config = write_config(health, "")?;

	let mut child = Command::new(env!("CARGO_BIN_EXE_relay_server"))
		.arg("--config")
		.arg(&config)
		.env("RUST_LOG", "warn")
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.kill_on_drop(true)
		.spawn()
		.context("spawn relay_server")?;

	wait_ready(health).await?;
	assert_eq!(get(health, "/healthz").await?, (200, "ok".to_string()));
	assert_eq!(get(health, "/directoryz").await?.0, 404);
	assert_eq!(get(health, "/nope").await?.0, 404);

	child.kill().await?;
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_outage_is_visible_on_health_endpoint() -> anyhow::Result<()> {
	let health = free_addr().await?;
	let nobody = free_addr().await?;
	let config = write_config(
		health,
		&format!("\n[directory]\nendpoint = \"tcp://{nobody}\"\nrequest_timeout_ms = 200\nbackoff_secs = 1\n"),
	)?;

	let mut child = Command::new(env!("CARGO_BIN_EXE_relay_server"))
		.arg("--config")
		.arg(&config)
		.env("RUST_LOG", "warn")
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.kill_on_drop(true)
		.spawn()
		.context("spawn relay_server")?;

	wait_ready(health).await?;
	let (status, body) = get(health, "/directoryz").await?;
	assert_eq!(status, 503);
	assert!(body.starts_with("service unavailable:"), "{body}");

	child.kill().await?;
	Ok(())
}

#[tokio::test]
async fn unknown_arguments_are_rejected() -> anyhow::Result<()> {
	let status = Command::new(env!("CARGO_BIN_EXE_relay_server"))
		.arg("--bogus")
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.status()
		.await?;
	assert_eq!(status.code(), Some(2));
	Ok(())
}
