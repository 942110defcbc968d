use std::path::PathBuf;

use clap::Parser;

// CLI configuration for Borehole.
#[doc(hidden)]
#[derive(Debug, Parser, Clone, PartialEq)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to bind the HTTP listener to.
    #[arg(long, default_value_t = String::from("0.0.0.0"), value_name = "ADDRESS")]
    pub listen_address: String,

    /// Port to bind the HTTP listener to.
    #[arg(long, default_value_t = 8080, value_name = "PORT")]
    pub port: u16,

    /// Seed for deterministic host key generation.
    /// A fresh random key is generated when unset.
    #[arg(long, value_name = "STRING")]
    pub key_seed: Option<String>,

    /// JSON file mapping "name:password" credentials to lists of
    /// allowed remote address patterns.
    #[arg(long, value_name = "FILE")]
    pub auth_file: Option<PathBuf>,

    /// Single "name:password" credential pair, allowed any remote.
    /// Merged into the credentials from --auth-file.
    #[arg(long, value_name = "NAME:PASSWORD")]
    pub auth: Option<String>,

    /// Upstream URL to reverse proxy non-tunnel requests to.
    /// Requests receive a 404 response when unset.
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// Allow clients to open SOCKS5 streams through the tunnel.
    #[arg(long, default_value_t = false)]
    pub socks5: bool,

    /// Seconds a client has to send its tunnel configuration after
    /// the SSH handshake before being disconnected.
    #[arg(long, default_value_t = 10, value_name = "SECONDS")]
    pub negotiation_timeout: u64,
}
