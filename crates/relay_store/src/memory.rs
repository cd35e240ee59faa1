#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use relay_domain::{AccountInfo, AccountName, Lane, Message, MessageId};
use tokio::sync::Mutex;

use crate::{MessageStore, StoreError};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	messages: Vec<Message>,
	last_id: i64,
	nonces: HashSet<(Lane, String)>,
	accounts: BTreeMap<AccountName, AccountInfo>,
}

impl InMemoryStore {
	/// Every stored message of `lane`, in id order.
	pub async fn messages(&self, lane: Lane) -> Vec<Message> {
		let guard = self.inner.lock().await;
		guard.messages.iter().filter(|m| m.lane == lane).cloned().collect()
	}

	/// Persisted cursor of `account`, if the account exists.
	pub async fn cursor(&self, account: &AccountName) -> Option<MessageId> {
		let guard = self.inner.lock().await;
		guard.accounts.get(account).map(|a| a.last_id)
	}

	/// Drop an account definition.
	pub async fn remove_account(&self, account: &AccountName) -> bool {
		let mut guard = self.inner.lock().await;
		guard.accounts.remove(account).is_some()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn insert(&self, msg: &Message) -> Result<MessageId, StoreError> {
		let mut guard = self.inner.lock().await;
		if let Some(nonce) = &msg.nonce
			&& !guard.nonces.insert((msg.lane, nonce.clone()))
		{
			return Err(StoreError::Duplicate {
				lane: msg.lane,
				nonce: nonce.clone(),
			});
		}

		guard.last_id += 1;
		let id = MessageId(guard.last_id);
		let mut stored = msg.clone();
		stored.id = id;
		guard.messages.push(stored);
		Ok(id)
	}

	async fn query(
		&self,
		account: &AccountName,
		lane: Lane,
		after: MessageId,
		limit: usize,
	) -> Result<Vec<Message>, StoreError> {
		let guard = self.inner.lock().await;
		Ok(guard
			.messages
			.iter()
			.filter(|m| m.id > after && m.lane == lane && &m.account == account)
			.take(limit)
			.cloned()
			.collect())
	}

	async fn max_id(&self) -> Result<MessageId, StoreError> {
		Ok(MessageId(self.inner.lock().await.last_id))
	}

	async fn read_account_config(&self) -> Result<Vec<AccountInfo>, StoreError> {
		Ok(self.inner.lock().await.accounts.values().cloned().collect())
	}

	async fn update_cursor(&self, account: &AccountName, id: MessageId) -> Result<(), StoreError> {
		let mut guard = self.inner.lock().await;
		if let Some(info) = guard.accounts.get_mut(account)
			&& info.last_id < id
		{
			info.last_id = id;
		}
		Ok(())
	}

	async fn upsert_account(&self, info: &AccountInfo) -> Result<(), StoreError> {
		let mut guard = self.inner.lock().await;
		let mut info = info.clone();
		if let Some(prev) = guard.accounts.get(&info.name) {
			info.last_id = info.last_id.max(prev.last_id);
		}
		guard.accounts.insert(info.name.clone(), info);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use relay_domain::AccountKind;

	use super::*;

	fn name(s: &str) -> AccountName {
		AccountName::new(s).unwrap()
	}

	fn out(account: &str, text: &str) -> Message {
		Message::new(Lane::Outgoing, name(account), "#c", "bot", "PRIVMSG", text, 0)
	}

	#[tokio::test]
	async fn ids_increase_and_query_filters() {
		let store = InMemoryStore::default();
		let a = store.insert(&out("a", "1")).await.unwrap();
		let b = store.insert(&out("b", "2")).await.unwrap();
		let c = store.insert(&out("a", "3")).await.unwrap();
		assert!(a < b && b < c);

		let rows = store.query(&name("a"), Lane::Outgoing, a, 10).await.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].id, c);
		assert_eq!(rows[0].text, "3");

		assert!(store.query(&name("a"), Lane::Incoming, MessageId::ZERO, 10).await.unwrap().is_empty());
		assert_eq!(store.max_id().await.unwrap(), c);
	}

	#[tokio::test]
	async fn duplicate_nonce_is_reported_once() {
		let store = InMemoryStore::default();
		let mut m = out("a", "x");
		m.id = MessageId(9);
		let echo = m.echo();

		store.insert(&echo).await.unwrap();
		let err = store.insert(&echo).await.unwrap_err();
		assert!(err.is_duplicate());
		assert_eq!(store.messages(Lane::Incoming).await.len(), 1);
	}

	#[tokio::test]
	async fn cursor_only_moves_forward() {
		let store = InMemoryStore::default();
		store
			.upsert_account(&AccountInfo::new(name("a"), AccountKind::Loopback))
			.await
			.unwrap();

		store.update_cursor(&name("a"), MessageId(10)).await.unwrap();
		store.update_cursor(&name("a"), MessageId(4)).await.unwrap();
		assert_eq!(store.cursor(&name("a")).await, Some(MessageId(10)));

		store
			.upsert_account(&AccountInfo::new(name("a"), AccountKind::Loopback))
			.await
			.unwrap();
		assert_eq!(store.cursor(&name("a")).await, Some(MessageId(10)));
	}
}
