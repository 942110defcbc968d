use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Proxy URL has no scheme")]
    MissingProxyScheme,
    #[error("Proxy URL has no host")]
    MissingProxyHost,
    #[error("Unsupported proxy scheme")]
    UnknownProxyScheme,
    #[error("Invalid credentials, expected name:password")]
    InvalidCredentialPair,
    #[error("Invalid address pattern for user {0}")]
    InvalidAddressPattern(String),
    #[error("Unable to read credentials file {0}")]
    UnreadableCredentialsFile(PathBuf),
    #[error("Missing Sec-WebSocket-Key header")]
    MissingWebSocketKey,
    #[error("expecting config request")]
    ExpectingConfigRequest,
    #[error("invalid config")]
    InvalidConfig,
    #[error("access to '{0}' denied")]
    AccessDenied(String),
}
