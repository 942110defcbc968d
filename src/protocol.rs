use serde::{Deserialize, Serialize};

use crate::error::ServerError;

// Token shared with clients via the Sec-WebSocket-Protocol header.
// Connections presenting a different token never reach the tunnel layer.
pub const PROTOCOL_VERSION: &str = "borehole-v1";

// Reported to clients during negotiation version checks.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

// Exec command carrying the tunnel configuration, followed by its
// JSON payload. The first request on every session must be this one.
pub(crate) const CONFIG_COMMAND: &str = "config";

// Keepalive exec command, replied to with success and no payload.
pub(crate) const PING_COMMAND: &str = "ping";

// Routing key requesting a SOCKS5 stream instead of a TCP forward.
pub(crate) const SOCKS_KEY: &str = "socks";

/// A single remote endpoint a client wants the server to reach on its
/// behalf. The literal host `socks` requests an in-process SOCKS5
/// stream and carries no meaningful port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub remote_host: String,
    pub remote_port: String,
}

impl RemoteSpec {
    pub fn is_socks(&self) -> bool {
        self.remote_host == SOCKS_KEY
    }

    /// The `host:port` form used for access checks and dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Payload of the client's `config` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub version: String,
    pub remotes: Vec<RemoteSpec>,
}

pub(crate) fn decode_config(payload: &[u8]) -> Result<TunnelConfig, ServerError> {
    serde_json::from_slice(payload).map_err(|_| ServerError::InvalidConfig)
}
