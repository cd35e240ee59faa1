#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown lane: {0}")]
	UnknownLane(String),
	#[error("unknown account kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Logical partition of the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
	/// Traffic received from the network.
	Incoming,
	/// Traffic queued by plugins for delivery to the network.
	Outgoing,
}

impl Lane {
	/// Stable string identifier (also the stored column value).
	pub const fn as_str(self) -> &'static str {
		match self {
			Lane::Incoming => "incoming",
			Lane::Outgoing => "outgoing",
		}
	}
}

impl fmt::Display for Lane {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Lane {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"incoming" | "in" => Ok(Lane::Incoming),
			"outgoing" | "out" => Ok(Lane::Outgoing),
			other => Err(ParseIdError::UnknownLane(other.to_string())),
		}
	}
}

/// Transport kind of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
	Irc,
	Telegram,
	Webhook,
	/// In-process transport, used for development and tests.
	Loopback,
}

impl AccountKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			AccountKind::Irc => "irc",
			AccountKind::Telegram => "telegram",
			AccountKind::Webhook => "webhook",
			AccountKind::Loopback => "loopback",
		}
	}
}

impl fmt::Display for AccountKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AccountKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"irc" => Ok(AccountKind::Irc),
			"telegram" | "tg" => Ok(AccountKind::Telegram),
			"webhook" => Ok(AccountKind::Webhook),
			"loopback" => Ok(AccountKind::Loopback),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Unique account name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountName(String);

impl AccountName {
	/// Create a non-empty `AccountName`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for AccountName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for AccountName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		AccountName::new(s.to_string())
	}
}

/// Store-assigned message identifier. Zero means "unassigned" (or "no cursor yet").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
	pub const ZERO: MessageId = MessageId(0);

	pub const fn get(self) -> i64 {
		self.0
	}

	pub const fn is_zero(self) -> bool {
		self.0 == 0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Command carried by acknowledgment messages.
pub const ACK_COMMAND: &str = "PONG";

/// Text prefix of an acknowledgment payload (`relay:lastid:<id>`).
pub const ACK_PREFIX: &str = "relay:lastid:";

/// A message crossing the network/plugin boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	/// Assigned by the store on insert; zero before that.
	#[serde(default)]
	pub id: MessageId,
	pub lane: Lane,
	pub account: AccountName,
	/// Channel or target (nick, chat id, ...).
	pub channel: String,
	/// Sender identity.
	pub sender: String,
	pub command: String,
	pub text: String,
	pub time_unix_ms: i64,
	/// Deduplication key; unique per lane when set.
	#[serde(default)]
	pub nonce: Option<String>,
}

impl Message {
	/// New unsaved message.
	pub fn new(
		lane: Lane,
		account: AccountName,
		channel: impl Into<String>,
		sender: impl Into<String>,
		command: impl Into<String>,
		text: impl Into<String>,
		time_unix_ms: i64,
	) -> Self {
		Self {
			id: MessageId::ZERO,
			lane,
			account,
			channel: channel.into(),
			sender: sender.into(),
			command: command.into(),
			text: text.into(),
			time_unix_ms,
			nonce: None,
		}
	}

	pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
		self.nonce = Some(nonce.into());
		self
	}

	/// Acknowledgment that everything up to `last_id` has been transmitted.
	pub fn ack(account: AccountName, last_id: MessageId, time_unix_ms: i64) -> Self {
		Self::new(
			Lane::Incoming,
			account,
			"",
			"",
			ACK_COMMAND,
			format!("{ACK_PREFIX}{last_id}"),
			time_unix_ms,
		)
	}

	/// `None` when this is not an acknowledgment, `Some(Err)` when it is one but the id is unreadable.
	pub fn ack_id(&self) -> Option<Result<MessageId, ParseIdError>> {
		if !self.command.eq_ignore_ascii_case(ACK_COMMAND) {
			return None;
		}
		let raw = self.text.trim().strip_prefix(ACK_PREFIX)?;
		let parsed = raw
			.trim()
			.parse::<i64>()
			.ok()
			.filter(|v| *v >= 0)
			.map(MessageId)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("bad ack id: {raw:?}")));
		Some(parsed)
	}

	/// Incoming-lane copy of a delivered outgoing message. The nonce makes replays collapse to one row.
	pub fn echo(&self) -> Self {
		Self {
			id: MessageId::ZERO,
			lane: Lane::Incoming,
			nonce: Some(echo_nonce(self.id)),
			..self.clone()
		}
	}
}

/// Nonce used for the incoming-lane copy of outgoing message `id`.
pub fn echo_nonce(id: MessageId) -> String {
	format!("echo:{id}")
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Channel an account should be present in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
	pub name: String,
	#[serde(default)]
	pub key: Option<SecretString>,
}

impl ChannelInfo {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			key: None,
		}
	}
}

/// Configuration snapshot for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
	pub name: AccountName,
	pub kind: AccountKind,
	/// Transport endpoint (`host:port`, URL, ...), interpreted by the adapter.
	pub endpoint: String,
	pub tls: bool,
	pub tls_insecure: bool,
	pub nick: String,
	#[serde(default)]
	pub password: Option<SecretString>,
	#[serde(default)]
	pub channels: Vec<ChannelInfo>,
	pub enabled: bool,
	/// Persisted delivery cursor.
	#[serde(default)]
	pub last_id: MessageId,
}

impl AccountInfo {
	/// Enabled account with no endpoint, credentials or channels.
	pub fn new(name: AccountName, kind: AccountKind) -> Self {
		let nick = name.as_str().to_string();
		Self {
			name,
			kind,
			endpoint: String::new(),
			tls: false,
			tls_insecure: false,
			nick,
			password: None,
			channels: Vec::new(),
			enabled: true,
			last_id: MessageId::ZERO,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn account(name: &str) -> AccountName {
		AccountName::new(name).unwrap()
	}

	#[test]
	fn lane_and_kind_parse_and_display() {
		assert_eq!("incoming".parse::<Lane>().unwrap(), Lane::Incoming);
		assert_eq!(" OUT ".parse::<Lane>().unwrap(), Lane::Outgoing);
		assert_eq!(Lane::Outgoing.to_string(), "outgoing");
		assert_eq!("IRC".parse::<AccountKind>().unwrap(), AccountKind::Irc);
		assert_eq!("tg".parse::<AccountKind>().unwrap(), AccountKind::Telegram);
		assert!(matches!("smtp".parse::<AccountKind>(), Err(ParseIdError::UnknownKind(_))));
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(AccountName::new("").is_err());
		assert!(AccountName::new("   ").is_err());
		assert!("".parse::<Lane>().is_err());
	}

	#[test]
	fn ack_is_recognized() {
		let ack = Message::ack(account("test"), MessageId(42), 0);
		assert_eq!(ack.lane, Lane::Incoming);
		assert_eq!(ack.ack_id(), Some(Ok(MessageId(42))));
	}

	#[test]
	fn plain_pong_is_not_an_ack() {
		let pong = Message::new(Lane::Incoming, account("test"), "", "server", "PONG", "irc.example.net", 0);
		assert_eq!(pong.ack_id(), None);

		let privmsg = Message::new(Lane::Incoming, account("test"), "#c", "n", "PRIVMSG", "relay:lastid:1", 0);
		assert_eq!(privmsg.ack_id(), None);
	}

	#[test]
	fn malformed_ack_is_an_error() {
		let mut ack = Message::ack(account("test"), MessageId(1), 0);
		ack.text = "relay:lastid:twelve".to_string();
		assert!(matches!(ack.ack_id(), Some(Err(ParseIdError::InvalidFormat(_)))));

		ack.text = "relay:lastid:-3".to_string();
		assert!(matches!(ack.ack_id(), Some(Err(_))));
	}

	#[test]
	fn echo_moves_to_incoming_with_stable_nonce() {
		let mut out = Message::new(Lane::Outgoing, account("test"), "#chan", "bot", "PRIVMSG", "hi", 5);
		out.id = MessageId(7);

		let echo = out.echo();
		assert_eq!(echo.lane, Lane::Incoming);
		assert_eq!(echo.id, MessageId::ZERO);
		assert_eq!(echo.nonce.as_deref(), Some("echo:7"));
		assert_eq!(echo.text, "hi");
		assert_eq!(out.echo().nonce, echo.nonce);
	}

	#[test]
	fn secrets_are_redacted() {
		let mut info = AccountInfo::new(account("test"), AccountKind::Irc);
		info.password = Some(SecretString::new("hunter2"));
		let dbg = format!("{info:?}");
		assert!(!dbg.contains("hunter2"));

		let json = serde_json::to_string(&info.password).unwrap();
		assert_eq!(json, "\"\"");
	}
}
