#![forbid(unsafe_code)]

use relay_domain::{AccountInfo, AccountKind, AccountName, ChannelInfo, Lane, Message, MessageId, SecretString};
use relay_store::{MessageStore, SqlStore};
use relay_util::time::unix_ms_now;

async fn open() -> SqlStore {
	SqlStore::connect("sqlite::memory:").await.expect("open sqlite store")
}

fn name(s: &str) -> AccountName {
	AccountName::new(s).expect("valid account name")
}

fn outgoing(account: &str, text: &str) -> Message {
	Message::new(Lane::Outgoing, name(account), "#relay", "bot", "PRIVMSG", text, unix_ms_now())
}

#[tokio::test]
async fn insert_assigns_increasing_ids_and_query_is_ordered() {
	let store = open().await;
	assert_eq!(store.max_id().await.unwrap(), MessageId::ZERO);

	let mut ids = Vec::new();
	for i in 0..5 {
		let account = if i % 2 == 0 { "a" } else { "b" };
		ids.push(store.insert(&outgoing(account, &format!("m{i}"))).await.unwrap());
	}
	assert!(ids.windows(2).all(|w| w[0] < w[1]));
	assert_eq!(store.max_id().await.unwrap(), ids[4]);

	let rows = store.query(&name("a"), Lane::Outgoing, ids[0], 100).await.unwrap();
	let texts: Vec<&str> = rows.iter().map(|m| m.text.as_str()).collect();
	assert_eq!(texts, vec!["m2", "m4"]);
	assert!(rows.iter().all(|m| m.lane == Lane::Outgoing && m.account == name("a")));

	let limited = store.query(&name("a"), Lane::Outgoing, MessageId::ZERO, 2).await.unwrap();
	assert_eq!(limited.len(), 2);
	assert_eq!(limited[0].id, ids[0]);
}

#[tokio::test]
async fn echo_replay_is_a_duplicate_not_a_failure() {
	let store = open().await;
	let id = store.insert(&outgoing("a", "hello")).await.unwrap();
	let mut delivered = outgoing("a", "hello");
	delivered.id = id;

	store.insert(&delivered.echo()).await.unwrap();
	let err = store.insert(&delivered.echo()).await.unwrap_err();
	assert!(err.is_duplicate(), "unexpected error: {err}");

	let incoming = store.query(&name("a"), Lane::Incoming, MessageId::ZERO, 10).await.unwrap();
	assert_eq!(incoming.len(), 1);
	assert_eq!(incoming[0].nonce.as_deref(), Some(format!("echo:{id}").as_str()));
}

#[tokio::test]
async fn messages_without_nonce_never_collide() {
	let store = open().await;
	store.insert(&outgoing("a", "same")).await.unwrap();
	store.insert(&outgoing("a", "same")).await.unwrap();
	assert_eq!(
		store.query(&name("a"), Lane::Outgoing, MessageId::ZERO, 10).await.unwrap().len(),
		2
	);
}

#[tokio::test]
async fn account_config_round_trips_with_channels() {
	let store = open().await;
	let mut info = AccountInfo::new(name("libera"), AccountKind::Irc);
	info.endpoint = "irc.libera.chat:6697".to_string();
	info.tls = true;
	info.password = Some(SecretString::new("s3cret"));
	info.channels = vec![ChannelInfo::new("#rust"), ChannelInfo {
		name: "#private".to_string(),
		key: Some(SecretString::new("k")),
	}];
	store.upsert_account(&info).await.unwrap();

	let mut disabled = AccountInfo::new(name("old"), AccountKind::Loopback);
	disabled.enabled = false;
	store.upsert_account(&disabled).await.unwrap();

	let snapshot = store.read_account_config().await.unwrap();
	assert_eq!(snapshot.len(), 2);
	let libera = snapshot.iter().find(|a| a.name == name("libera")).unwrap();
	assert_eq!(libera.kind, AccountKind::Irc);
	assert!(libera.tls);
	assert_eq!(libera.password.as_ref().map(|p| p.expose()), Some("s3cret"));
	let channels: Vec<&str> = libera.channels.iter().map(|c| c.name.as_str()).collect();
	assert_eq!(channels, vec!["#private", "#rust"]);
	assert!(!snapshot.iter().find(|a| a.name == name("old")).unwrap().enabled);

	info.channels = vec![ChannelInfo::new("#rust")];
	store.upsert_account(&info).await.unwrap();
	let snapshot = store.read_account_config().await.unwrap();
	let libera = snapshot.iter().find(|a| a.name == name("libera")).unwrap();
	assert_eq!(libera.channels.len(), 1);
}

#[tokio::test]
async fn cursor_updates_are_forward_only() {
	let store = open().await;
	store
		.upsert_account(&AccountInfo::new(name("a"), AccountKind::Loopback))
		.await
		.unwrap();

	store.update_cursor(&name("a"), MessageId(12)).await.unwrap();
	store.update_cursor(&name("a"), MessageId(3)).await.unwrap();
	store.update_cursor(&name("missing"), MessageId(3)).await.unwrap();

	let snapshot = store.read_account_config().await.unwrap();
	assert_eq!(snapshot[0].last_id, MessageId(12));

	let mut rewind = AccountInfo::new(name("a"), AccountKind::Loopback);
	rewind.last_id = MessageId(1);
	store.upsert_account(&rewind).await.unwrap();
	assert_eq!(store.read_account_config().await.unwrap()[0].last_id, MessageId(12));
}

#[tokio::test]
async fn unsupported_url_is_rejected() {
	let err = SqlStore::connect("mongodb://localhost").await.err().expect("must fail");
	assert!(err.to_string().contains("unsupported database_url"));
}
