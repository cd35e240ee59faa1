#![forbid(unsafe_code)]

pub mod endpoint {
	/// Parsed `scheme://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct Endpoint {
		pub scheme: String,
		pub host: String,
		pub port: u16,
	}

	impl Endpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Parse an endpoint string of the form `scheme://host:port`, requiring `expected_scheme`.
		pub fn parse_with_scheme(s: &str, expected_scheme: &str) -> Result<Self, String> {
			let e = Self::parse(s)?;
			if !e.scheme.eq_ignore_ascii_case(expected_scheme) {
				return Err(format!(
					"invalid endpoint scheme {:?} (expected {expected_scheme}://host:port): {s}",
					e.scheme
				));
			}
			Ok(e)
		}

		/// Parse an endpoint string of the form `scheme://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected scheme://host:port)".to_string());
			}

			let (scheme, rest) = s
				.split_once("://")
				.ok_or_else(|| format!("invalid endpoint (expected scheme://host:port): {s}"))?;

			if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') {
				return Err(format!("invalid endpoint scheme (expected scheme://host:port): {s}"));
			}

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected scheme://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected scheme://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected scheme://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:389): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				scheme: scheme.to_ascii_lowercase(),
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = Endpoint::parse("tcp://directory.example.com:389").unwrap();
			assert_eq!(e.scheme, "tcp");
			assert_eq!(e.host, "directory.example.com");
			assert_eq!(e.port, 389);
			assert_eq!(e.hostport(), "directory.example.com:389");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = Endpoint::parse("ircs://[::1]:6697").unwrap();
			assert_eq!(e.scheme, "ircs");
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.hostport(), "[::1]:6697");
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = Endpoint::parse("tcp://::1:389").unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn rejects_path_query_fragment() {
			assert!(Endpoint::parse("tcp://127.0.0.1:389/").is_err());
			assert!(Endpoint::parse("tcp://127.0.0.1:389?x=y").is_err());
			assert!(Endpoint::parse("tcp://127.0.0.1:389#frag").is_err());
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(Endpoint::parse("tcp://127.0.0.1:0").is_err());
			assert!(Endpoint::parse("tcp://127.0.0.1").is_err());
			assert!(Endpoint::parse("127.0.0.1:389").is_err());
		}

		#[test]
		fn scheme_must_match_when_required() {
			assert!(Endpoint::parse_with_scheme("TCP://127.0.0.1:389", "tcp").is_ok());
			assert!(Endpoint::parse_with_scheme("quic://127.0.0.1:389", "tcp").is_err());
		}
	}
}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}
