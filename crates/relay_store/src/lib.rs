#![forbid(unsafe_code)]

//! Durable message log and account configuration.
//!
//! The log is append-only: every message gets a strictly increasing id on insert and is never
//! mutated afterwards. Deduplication is keyed on `(lane, nonce)`; a second insert with the same
//! key is reported as [`StoreError::Duplicate`] so callers replaying an insert can treat it as a
//! no-op while still seeing every other failure.

mod memory;
mod sql;

use std::sync::Arc;

use relay_domain::{AccountInfo, AccountName, Lane, Message, MessageId};
use thiserror::Error;

pub use memory::InMemoryStore;
pub use sql::SqlStore;

/// URL that selects the in-memory backend.
pub const MEMORY_URL: &str = "memory:";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
	/// Insert collided with an existing `(lane, nonce)`.
	#[error("duplicate message (lane={lane}, nonce={nonce})")]
	Duplicate { lane: Lane, nonce: String },

	/// Stored data could not be decoded.
	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[error(transparent)]
	Database(#[from] sqlx::Error),
}

impl StoreError {
	pub fn is_duplicate(&self) -> bool {
		matches!(self, StoreError::Duplicate { .. })
	}
}

/// Minimal query/insert surface over the message log.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Append `msg` (its `id` is ignored) and return the assigned id.
	async fn insert(&self, msg: &Message) -> Result<MessageId, StoreError>;

	/// Messages with `id > after` for `account` in `lane`, ascending, at most `limit`.
	async fn query(
		&self,
		account: &AccountName,
		lane: Lane,
		after: MessageId,
		limit: usize,
	) -> Result<Vec<Message>, StoreError>;

	/// Largest id in the log (zero when empty).
	async fn max_id(&self) -> Result<MessageId, StoreError>;

	/// Consistent snapshot of every account with its channels.
	async fn read_account_config(&self) -> Result<Vec<AccountInfo>, StoreError>;

	/// Move the persisted cursor of `account` forward to `id`. Never moves it backwards.
	async fn update_cursor(&self, account: &AccountName, id: MessageId) -> Result<(), StoreError>;

	/// Create or replace an account definition. The cursor only moves forward.
	async fn upsert_account(&self, info: &AccountInfo) -> Result<(), StoreError>;
}

/// Open the store selected by `database_url` (`memory:`, `sqlite:...`, `postgres://...`).
pub async fn connect(database_url: &str) -> anyhow::Result<Arc<dyn MessageStore>> {
	if database_url.trim() == MEMORY_URL {
		return Ok(Arc::new(InMemoryStore::default()));
	}
	let store = SqlStore::connect(database_url).await?;
	Ok(Arc::new(store))
}
