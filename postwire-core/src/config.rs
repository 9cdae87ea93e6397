//! Peer configuration. Hosts deserialize it from their own config files.

use std::time::Duration;

use serde::Deserialize;

use crate::send::SendOptions;
use crate::wire::DEFAULT_MAX_MESSAGE_BYTES;

/// Protocol settings for one peer. No timeouts by default: an unanswered
/// request stays pending until the host gives up on it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Fail a request that was not acknowledged within this many ms.
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,
    /// Fail an acknowledged request that got no response within this many ms.
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
    /// Largest encoded message accepted or produced (default 1 MiB).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: None,
            response_timeout_ms: None,
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl PeerConfig {
    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            ack_timeout: self.ack_timeout_ms.map(Duration::from_millis),
            response_timeout: self.response_timeout_ms.map(Duration::from_millis),
        }
    }
}
