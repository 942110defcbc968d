use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use russh::SshId;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub mod config;
mod droppable_handle;
mod error;
mod http;
pub mod keys;
pub mod protocol;
pub mod pump;
mod socks;
mod tunnel;
mod users;
pub mod ws;

pub use config::ApplicationConfig;

use crate::{
    http::ReverseProxy,
    keys::{fingerprint, generate_key},
    protocol::PROTOCOL_VERSION,
    socks::Socks5Server,
    users::{Authenticator, UserTable},
};

// Data shared between tunnel sessions and the HTTP dispatcher, plus
// the lifecycle of the single listener.
pub struct BoreholeServer {
    listen_address: String,
    port: u16,
    // Printable digest of the host public key, logged at startup.
    fingerprint: String,
    // SSH server configuration holding the host key.
    pub(crate) ssh_config: Arc<russh::server::Config>,
    // Credential checks and live session-to-user bindings.
    pub(crate) auth: Authenticator,
    // Upstream for non-tunnel requests, when configured.
    pub(crate) proxy: Option<ReverseProxy>,
    // In-process SOCKS5 endpoint, when enabled.
    pub(crate) socks: Option<Socks5Server>,
    // How long a client may take to configure its session.
    pub(crate) negotiation_timeout: Duration,
    // Source of per-session ids, which also key the user bindings.
    session_counter: AtomicUsize,
    // Root token; cancelling it stops the accept loop and errors out
    // every in-flight session.
    pub(crate) shutdown: CancellationToken,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BoreholeServer {
    pub fn new(config: ApplicationConfig) -> anyhow::Result<Arc<Self>> {
        let mut users = match config.auth_file {
            Some(ref path) => {
                UserTable::from_file(path).with_context(|| "Error loading credentials file")?
            }
            None => UserTable::default(),
        };
        if let Some(ref credentials) = config.auth {
            users
                .insert_credentials(credentials)
                .with_context(|| "Error parsing credentials")?;
        }
        let key =
            generate_key(config.key_seed.as_deref()).with_context(|| "Error generating host key")?;
        let fingerprint = fingerprint(key.public_key());
        let ssh_config = Arc::new(russh::server::Config {
            server_id: SshId::Standard(format!("SSH-2.0-{}-server", PROTOCOL_VERSION)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![key],
            ..Default::default()
        });
        let proxy = config
            .proxy
            .as_deref()
            .map(ReverseProxy::new)
            .transpose()
            .with_context(|| "Error configuring reverse proxy")?;
        let socks = config.socks5.then(Socks5Server::new);
        if socks.is_some() {
            info!("SOCKS5 enabled");
        }
        Ok(Arc::new(BoreholeServer {
            listen_address: config.listen_address,
            port: config.port,
            fingerprint,
            ssh_config,
            auth: Authenticator::new(users),
            proxy,
            socks,
            negotiation_timeout: Duration::from_secs(config.negotiation_timeout),
            session_counter: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            listener_handle: Mutex::new(None),
        }))
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    // Bind the listener and start accepting connections in the
    // background.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!("Fingerprint {}", self.fingerprint);
        if self.auth.auth_enabled() {
            info!("User authentication enabled");
        }
        if self.proxy.is_some() {
            info!("Reverse proxy enabled");
        }
        let listener = TcpListener::bind((self.listen_address.as_str(), self.port))
            .await
            .with_context(|| "Error binding HTTP listener")?;
        info!("Listening on {}...", listener.local_addr()?);
        let server = Arc::clone(self);
        let handle = tokio::spawn(async move { server.accept_loop(listener).await });
        *self.listener_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    // Block until the accept loop exits.
    pub async fn wait(&self) -> anyhow::Result<()> {
        let handle = self.listener_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.with_context(|| "Listener task failed")?;
        }
        Ok(())
    }

    // Graceful stop: the accept loop exits and in-flight sessions see
    // a transport error at their next I/O.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        self.start().await?;
        self.wait().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            error!("Failed to accept connection: {}", error);
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let dispatcher = Arc::clone(&server);
                        let service = service_fn(move |request: Request<Incoming>| {
                            http::dispatch(Arc::clone(&dispatcher), request, peer)
                        });
                        let connection = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades();
                        tokio::pin!(connection);
                        tokio::select! {
                            result = &mut connection => {
                                if let Err(error) = result {
                                    debug!("Connection from {} errored: {:?}", peer, error);
                                }
                            }
                            _ = server.shutdown.cancelled() => {}
                        }
                    });
                }
            }
        }
    }

    pub(crate) fn next_session_id(&self) -> usize {
        self.session_counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

pub async fn entrypoint(config: ApplicationConfig) -> anyhow::Result<()> {
    BoreholeServer::new(config)?.run().await
}
