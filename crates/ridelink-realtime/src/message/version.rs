//! Protocol version parsing and compatibility.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use ridelink_core::error::AppError;

/// Wire protocol version compiled into this client.
pub const CLIENT_PROTOCOL_VERSION: &str = "2.0.0";

/// A `major.minor.patch` version. Missing components parse as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Breaking-change component.
    pub major: u64,
    /// Additive-change component.
    pub minor: u64,
    /// Fix component.
    pub patch: u64,
}

impl ProtocolVersion {
    /// Build a version from its parts.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The version this client speaks.
    pub fn client() -> Self {
        CLIENT_PROTOCOL_VERSION
            .parse()
            .unwrap_or(Self::new(2, 0, 0))
    }
}

impl FromStr for ProtocolVersion {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        if trimmed.is_empty() {
            return Err(AppError::protocol("Empty protocol version"));
        }

        let mut parts = [0u64; 3];
        for (index, part) in trimmed.split('.').enumerate() {
            if index >= parts.len() {
                return Err(AppError::protocol(format!(
                    "Too many components in protocol version: {s}"
                )));
            }
            // Pre-release/build suffixes ("1.4.0-beta") are ignored.
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            parts[index] = digits.parse().map_err(|_| {
                AppError::protocol(format!("Invalid protocol version component: {s}"))
            })?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Outcome of the per-connection version exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedProtocol {
    /// What this client sent.
    pub client: ProtocolVersion,
    /// What the server advertised, if it answered in time.
    pub server: Option<ProtocolVersion>,
    /// Lowest server major this client accepts.
    pub min_server_major: u64,
}

impl NegotiatedProtocol {
    /// Record a negotiation result.
    pub fn new(
        client: ProtocolVersion,
        server: Option<ProtocolVersion>,
        min_server_major: u64,
    ) -> Self {
        Self {
            client,
            server,
            min_server_major,
        }
    }

    /// Only a server major below the supported minimum is a mismatch.
    /// An unanswered negotiation is not treated as one.
    pub fn is_mismatch(&self) -> bool {
        self.server
            .map(|server| server.major < self.min_server_major)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_and_partial() {
        assert_eq!("2.3.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(2, 3, 1));
        assert_eq!("v1.4".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(1, 4, 0));
        assert_eq!("3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(3, 0, 0));
        assert_eq!(
            "1.4.0-beta".parse::<ProtocolVersion>().unwrap(),
            ProtocolVersion::new(1, 4, 0)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ProtocolVersion>().is_err());
        assert!("x.y".parse::<ProtocolVersion>().is_err());
        assert!("1.2.3.4".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_only_lower_major_mismatches() {
        let client = ProtocolVersion::new(2, 0, 0);
        let older = NegotiatedProtocol::new(client, Some(ProtocolVersion::new(1, 9, 9)), 2);
        let newer_minor = NegotiatedProtocol::new(client, Some(ProtocolVersion::new(2, 7, 0)), 2);
        let newer_major = NegotiatedProtocol::new(client, Some(ProtocolVersion::new(3, 0, 0)), 2);
        let silent = NegotiatedProtocol::new(client, None, 2);

        assert!(older.is_mismatch());
        assert!(!newer_minor.is_mismatch());
        assert!(!newer_major.is_mismatch());
        assert!(!silent.is_mismatch());
    }

    #[test]
    fn test_client_version_parses() {
        assert_eq!(ProtocolVersion::client().to_string(), CLIENT_PROTOCOL_VERSION);
    }
}
