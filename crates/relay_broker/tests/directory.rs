#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use relay_broker::directory::{DirectoryConnector, DirectoryRequest, DirectoryResponse, PING_OP};
use relay_broker::{BrokerConfig, BrokerError, ConnectionBroker};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Minimal directory service: answers `lookup` with one entry and closes the connection on `quit`.
async fn serve_directory(listener: TcpListener) {
	loop {
		let Ok((stream, _)) = listener.accept().await else {
			return;
		};
		tokio::spawn(async move {
			let (read, mut write) = stream.into_split();
			let mut lines = BufReader::new(read).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				let req: DirectoryRequest = serde_json::from_str(&line).unwrap();
				let resp = match req.op.as_str() {
					PING_OP => DirectoryResponse {
						ok: true,
						..Default::default()
					},
					"lookup" => {
						let mut entry = BTreeMap::new();
						entry.insert("uid".to_string(), req.attrs.get("uid").cloned().unwrap_or_default());
						entry.insert("cn".to_string(), "Alice".to_string());
						DirectoryResponse {
							ok: true,
							entries: vec![entry],
							error: None,
						}
					}
					"quit" => return,
					other => DirectoryResponse {
						ok: false,
						entries: Vec::new(),
						error: Some(format!("unknown op {other}")),
					},
				};
				let mut frame = serde_json::to_vec(&resp).unwrap();
				frame.push(b'\n');
				write.write_all(&frame).await.unwrap();
			}
		});
	}
}

fn cfg() -> BrokerConfig {
	BrokerConfig {
		request_timeout: Duration::from_millis(500),
		dial_timeout: Duration::from_millis(500),
		keepalive_interval: Duration::from_millis(50),
		backoff: Duration::from_millis(20),
	}
}

#[tokio::test]
async fn lookup_through_shared_connection() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(serve_directory(listener));

	let connector = DirectoryConnector::new(&format!("tcp://{addr}")).unwrap();
	let broker = ConnectionBroker::start(connector, cfg());
	let a = broker.acquire();
	let b = broker.acquire();

	let resp = a
		.request(DirectoryRequest::new("lookup").attr("uid", "alice"))
		.await
		.unwrap();
	assert!(resp.ok);
	assert_eq!(resp.entries[0].get("cn").map(String::as_str), Some("Alice"));

	let resp = b.request(DirectoryRequest::new("bogus")).await.unwrap();
	assert!(!resp.ok);
	assert_eq!(resp.error.as_deref(), Some("unknown op bogus"));

	// Idle long enough for a few keepalives; the connection stays usable.
	tokio::time::sleep(Duration::from_millis(150)).await;
	assert!(b.request(DirectoryRequest::ping()).await.unwrap().ok);
	assert_eq!(broker.last_error(), None);
}

#[tokio::test]
async fn dropped_connection_is_redialed() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(serve_directory(listener));

	let broker = ConnectionBroker::start(DirectoryConnector::new(&format!("tcp://{addr}")).unwrap(), cfg());
	let handle = broker.acquire();

	let err = handle.request(DirectoryRequest::new("quit")).await.unwrap_err();
	assert!(matches!(err, BrokerError::Request(_)), "{err:?}");

	let resp = handle
		.request(DirectoryRequest::new("lookup").attr("uid", "bob"))
		.await
		.unwrap();
	assert_eq!(resp.entries[0].get("uid").map(String::as_str), Some("bob"));
}

#[tokio::test]
async fn unreachable_service_reports_the_dial_error() {
	// Bind then drop to get a port nobody listens on.
	let addr = {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		listener.local_addr().unwrap()
	};

	let mut cfg = cfg();
	cfg.request_timeout = Duration::from_millis(100);
	let broker = ConnectionBroker::start(DirectoryConnector::new(&format!("tcp://{addr}")).unwrap(), cfg);
	let handle = broker.acquire();

	match handle.request(DirectoryRequest::ping()).await.unwrap_err() {
		BrokerError::Unavailable(msg) => assert!(msg.contains("connect to directory service"), "{msg}"),
		other => panic!("unexpected error: {other:?}"),
	}
	assert!(broker.last_error().is_some());
}
