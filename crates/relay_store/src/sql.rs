#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use relay_domain::{AccountInfo, AccountKind, AccountName, ChannelInfo, Lane, Message, MessageId, SecretString};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::warn;

use crate::{MessageStore, StoreError};

type MessageRow = (i64, String, String, String, String, String, String, i64, Option<String>);
type AccountRow = (String, String, String, bool, bool, String, Option<String>, bool, i64);
type ChannelRow = (String, String, Option<String>);

/// sqlx-backed store (SQLite or Postgres, chosen by URL scheme).
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// Every connection to an in-memory database is a separate database.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect_with(opts)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(8)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use memory:, sqlite:, postgres:)"))
		}
	}
}

fn map_insert_error(err: sqlx::Error, msg: &Message) -> StoreError {
	if let sqlx::Error::Database(db) = &err
		&& db.is_unique_violation()
	{
		return StoreError::Duplicate {
			lane: msg.lane,
			nonce: msg.nonce.clone().unwrap_or_default(),
		};
	}
	StoreError::Database(err)
}

fn decode_message(row: MessageRow) -> Result<Message, StoreError> {
	let (id, lane, account, channel, sender, command, text, time_unix_ms, nonce) = row;
	let lane = Lane::from_str(&lane).map_err(|e| StoreError::Corrupt(format!("message {id}: {e}")))?;
	let account = AccountName::new(account).map_err(|e| StoreError::Corrupt(format!("message {id}: {e}")))?;
	Ok(Message {
		id: MessageId(id),
		lane,
		account,
		channel,
		sender,
		command,
		text,
		time_unix_ms,
		nonce,
	})
}

fn decode_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, StoreError> {
	rows.into_iter().map(decode_message).collect()
}

/// Rows that do not decode are skipped so one bad definition cannot block every other account.
fn decode_accounts(accounts: Vec<AccountRow>, channels: Vec<ChannelRow>) -> Vec<AccountInfo> {
	let mut out: Vec<AccountInfo> = Vec::with_capacity(accounts.len());
	for (name, kind, endpoint, tls, tls_insecure, nick, password, enabled, last_id) in accounts {
		let name = match AccountName::new(name.clone()) {
			Ok(n) => n,
			Err(e) => {
				warn!(account = %name, error = %e, "skipping account with invalid name");
				continue;
			}
		};
		let kind = match AccountKind::from_str(&kind) {
			Ok(k) => k,
			Err(e) => {
				warn!(account = %name, error = %e, "skipping account with invalid kind");
				continue;
			}
		};
		out.push(AccountInfo {
			name,
			kind,
			endpoint,
			tls,
			tls_insecure,
			nick,
			password: password.filter(|p| !p.is_empty()).map(SecretString::new),
			channels: Vec::new(),
			enabled,
			last_id: MessageId(last_id),
		});
	}

	for (account, name, key) in channels {
		if let Some(info) = out.iter_mut().find(|a| a.name.as_str() == account) {
			info.channels.push(ChannelInfo {
				name,
				key: key.filter(|k| !k.is_empty()).map(SecretString::new),
			});
		}
	}
	out
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn insert(&self, msg: &Message) -> Result<MessageId, StoreError> {
		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as::<_, (i64,)>(
				"INSERT INTO messages (lane, account, channel, sender, command, text, time_unix_ms, nonce) \
				VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
			)
			.bind(msg.lane.as_str())
			.bind(msg.account.as_str())
			.bind(&msg.channel)
			.bind(&msg.sender)
			.bind(&msg.command)
			.bind(&msg.text)
			.bind(msg.time_unix_ms)
			.bind(msg.nonce.as_deref())
			.fetch_one(pool)
			.await
			.map_err(|e| map_insert_error(e, msg))?,
			SqlBackend::Postgres(pool) => sqlx::query_as::<_, (i64,)>(
				"INSERT INTO messages (lane, account, channel, sender, command, text, time_unix_ms, nonce) \
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
			)
			.bind(msg.lane.as_str())
			.bind(msg.account.as_str())
			.bind(&msg.channel)
			.bind(&msg.sender)
			.bind(&msg.command)
			.bind(&msg.text)
			.bind(msg.time_unix_ms)
			.bind(msg.nonce.as_deref())
			.fetch_one(pool)
			.await
			.map_err(|e| map_insert_error(e, msg))?,
		};
		Ok(MessageId(id.0))
	}

	async fn query(
		&self,
		account: &AccountName,
		lane: Lane,
		after: MessageId,
		limit: usize,
	) -> Result<Vec<Message>, StoreError> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let rows = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as::<_, MessageRow>(
					"SELECT id, lane, account, channel, sender, command, text, time_unix_ms, nonce FROM messages \
					WHERE id > ? AND account = ? AND lane = ? ORDER BY id ASC LIMIT ?",
				)
				.bind(after.get())
				.bind(account.as_str())
				.bind(lane.as_str())
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as::<_, MessageRow>(
					"SELECT id, lane, account, channel, sender, command, text, time_unix_ms, nonce FROM messages \
					WHERE id > $1 AND account = $2 AND lane = $3 ORDER BY id ASC LIMIT $4",
				)
				.bind(after.get())
				.bind(account.as_str())
				.bind(lane.as_str())
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
		};
		decode_messages(rows)
	}

	async fn max_id(&self) -> Result<MessageId, StoreError> {
		let row: (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM messages")
					.fetch_one(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT COALESCE(MAX(id), 0)::BIGINT FROM messages")
					.fetch_one(pool)
					.await?
			}
		};
		Ok(MessageId(row.0))
	}

	async fn read_account_config(&self) -> Result<Vec<AccountInfo>, StoreError> {
		const ACCOUNTS: &str = "SELECT name, kind, endpoint, tls, tls_insecure, nick, password, enabled, last_id \
			FROM accounts ORDER BY name";
		const CHANNELS: &str = "SELECT account, name, channel_key FROM account_channels ORDER BY account, name";

		let (accounts, channels) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				// Both reads share one snapshot: a concurrent cursor commit is seen entirely or not at all.
				let mut tx = pool.begin().await?;
				let accounts: Vec<AccountRow> = sqlx::query_as(ACCOUNTS).fetch_all(&mut *tx).await?;
				let channels: Vec<ChannelRow> = sqlx::query_as(CHANNELS).fetch_all(&mut *tx).await?;
				tx.commit().await?;
				(accounts, channels)
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
					.execute(&mut *tx)
					.await?;
				let accounts: Vec<AccountRow> = sqlx::query_as(ACCOUNTS).fetch_all(&mut *tx).await?;
				let channels: Vec<ChannelRow> = sqlx::query_as(CHANNELS).fetch_all(&mut *tx).await?;
				tx.commit().await?;
				(accounts, channels)
			}
		};
		Ok(decode_accounts(accounts, channels))
	}

	async fn update_cursor(&self, account: &AccountName, id: MessageId) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE accounts SET last_id = ? WHERE name = ? AND last_id < ?")
					.bind(id.get())
					.bind(account.as_str())
					.bind(id.get())
					.execute(pool)
					.await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE accounts SET last_id = $1 WHERE name = $2 AND last_id < $1")
					.bind(id.get())
					.bind(account.as_str())
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}

	async fn upsert_account(&self, info: &AccountInfo) -> Result<(), StoreError> {
		let password = info.password.as_ref().map(|p| p.expose().to_string());
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query(
					"INSERT INTO accounts (name, kind, endpoint, tls, tls_insecure, nick, password, enabled, last_id) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
					ON CONFLICT(name) DO UPDATE SET kind = excluded.kind, endpoint = excluded.endpoint, \
					tls = excluded.tls, tls_insecure = excluded.tls_insecure, nick = excluded.nick, \
					password = excluded.password, enabled = excluded.enabled, \
					last_id = MAX(accounts.last_id, excluded.last_id)",
				)
				.bind(info.name.as_str())
				.bind(info.kind.as_str())
				.bind(&info.endpoint)
				.bind(info.tls)
				.bind(info.tls_insecure)
				.bind(&info.nick)
				.bind(password.as_deref())
				.bind(info.enabled)
				.bind(info.last_id.get())
				.execute(&mut *tx)
				.await?;

				sqlx::query("DELETE FROM account_channels WHERE account = ?")
					.bind(info.name.as_str())
					.execute(&mut *tx)
					.await?;
				for ch in &info.channels {
					sqlx::query("INSERT INTO account_channels (account, name, channel_key) VALUES (?, ?, ?)")
						.bind(info.name.as_str())
						.bind(&ch.name)
						.bind(ch.key.as_ref().map(|k| k.expose()))
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query(
					"INSERT INTO accounts (name, kind, endpoint, tls, tls_insecure, nick, password, enabled, last_id) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
					ON CONFLICT (name) DO UPDATE SET kind = EXCLUDED.kind, endpoint = EXCLUDED.endpoint, \
					tls = EXCLUDED.tls, tls_insecure = EXCLUDED.tls_insecure, nick = EXCLUDED.nick, \
					password = EXCLUDED.password, enabled = EXCLUDED.enabled, \
					last_id = GREATEST(accounts.last_id, EXCLUDED.last_id)",
				)
				.bind(info.name.as_str())
				.bind(info.kind.as_str())
				.bind(&info.endpoint)
				.bind(info.tls)
				.bind(info.tls_insecure)
				.bind(&info.nick)
				.bind(password.as_deref())
				.bind(info.enabled)
				.bind(info.last_id.get())
				.execute(&mut *tx)
				.await?;

				sqlx::query("DELETE FROM account_channels WHERE account = $1")
					.bind(info.name.as_str())
					.execute(&mut *tx)
					.await?;
				for ch in &info.channels {
					sqlx::query("INSERT INTO account_channels (account, name, channel_key) VALUES ($1, $2, $3)")
						.bind(info.name.as_str())
						.bind(&ch.name)
						.bind(ch.key.as_ref().map(|k| k.expose()))
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
		}
		Ok(())
	}
}
