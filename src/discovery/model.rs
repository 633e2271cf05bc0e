use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Windows,
    Darwin,
}

impl Os {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Os::Windows,
            "macos" => Os::Darwin,
            _ => Os::Linux,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Windows => "windows",
            Os::Darwin => "darwin",
        }
    }
}

impl Default for Os {
    fn default() -> Self {
        Os::current()
    }
}

/// One reachable address of a peer. Liveness is tracked per route; a device
/// broadcasting on several interfaces shows up as several routes under the
/// same peer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteState {
    pub ip: String,
    pub last_seen: DateTime<Utc>,
}

/// A discovered endpoint. `id` is stable for the lifetime of the remote
/// installation; `public_key` is the identity the trust list binds against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub routes: HashMap<String, RouteState>,
    pub port: u16,
    #[serde(default)]
    pub os: Os,
    #[serde(default)]
    pub public_key: String,
    /// Sticky: once an announcement disagrees with the trust list this stays
    /// set until the peer expires or the user re-trusts it. While set, name,
    /// os and public_key are frozen at their first-mismatch values.
    #[serde(default)]
    pub trust_mismatch: bool,
}

/// UDP broadcast payload. `signature` covers the pipe-delimited signing
/// payload, not the JSON encoding, so field order on the wire is irrelevant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePacket {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub os: Os,
    pub public_key: String,
    #[serde(default)]
    pub signature: String,
}

impl PresencePacket {
    /// Deterministic byte string the announcement signature is computed over:
    /// `id|name|port|os|publicKey`, decimal port, no trailing newline.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}",
            self.id,
            self.name,
            self.port,
            self.os.as_str(),
            self.public_key
        )
        .into_bytes()
    }
}
