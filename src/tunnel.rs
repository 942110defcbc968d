use std::{net::SocketAddr, sync::Arc};

use log::{debug, info};
use russh::{
    server::{run_stream, Auth, Handler, Msg, Session},
    Channel, ChannelId, CryptoVec, Disconnect, MethodKind, MethodSet,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::sleep,
};
use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::{
    droppable_handle::DroppableHandle,
    error::ServerError,
    protocol::{decode_config, BUILD_VERSION, CONFIG_COMMAND, PING_COMMAND, SOCKS_KEY},
    pump::pipe,
    users::{AuthOutcome, User},
    ws::WsStream,
    BoreholeServer,
};

// Layer the SSH transport over an upgraded WebSocket and drive the
// session until the transport closes or the server shuts down.
pub(crate) async fn serve_tunnel<S>(server: Arc<BoreholeServer>, io: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let websocket = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
    let transport = WsStream::new(websocket);
    let id = server.next_session_id();
    let cancellation_token = server.shutdown.child_token();
    let handler = ServerHandler {
        id,
        peer,
        server: Arc::clone(&server),
        user: None,
        negotiated: false,
        negotiation_timer: None,
        channel_count: 0,
        cancellation_token: cancellation_token.clone(),
    };
    debug!("session#{} ({}): handshaking", id, peer);
    let mut session = match run_stream(Arc::clone(&server.ssh_config), transport, handler).await {
        Ok(session) => session,
        Err(error) => {
            debug!("session#{} ({}): failed to handshake ({})", id, peer, error);
            return;
        }
    };
    tokio::select! {
        result = &mut session => match result {
            Ok(_) => debug!("session#{} ({}): closed", id, peer),
            Err(error) => debug!("session#{} ({}): closed ({})", id, peer, error),
        },
        _ = cancellation_token.cancelled() => {
            debug!("session#{} ({}): transport closed", id, peer);
            let _ = session
                .handle()
                .disconnect(Disconnect::ByApplication, "".into(), "".into())
                .await;
        }
    }
}

// Per-session SSH state. One handler exists per tunnel session; its
// teardown releases the session's user binding on every exit path.
pub(crate) struct ServerHandler {
    // The unique ID of this session, also the binding key.
    id: usize,
    // The IP and port of the connection, for logging.
    peer: SocketAddr,
    // Reference to the shared server data and services.
    server: Arc<BoreholeServer>,
    // The user this session authenticated as, when authentication is
    // enabled.
    user: Option<Arc<User>>,
    // Whether the configuration exchange completed. Channels may only
    // open afterwards.
    negotiated: bool,
    // Deadline task that closes the transport if the client does not
    // configure the session in time.
    negotiation_timer: Option<DroppableHandle<()>>,
    // Counter assigning per-session channel ids, for logging only.
    channel_count: usize,
    // Cancelling this closes the session's transport.
    cancellation_token: CancellationToken,
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        self.server.auth.release(self.id);
    }
}

impl ServerHandler {
    // Handle the one-shot configuration exchange. Any failure replies
    // with a reason and closes the session before channels can open.
    async fn negotiate(
        &mut self,
        channel: ChannelId,
        request_type: &str,
        payload: &str,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        if request_type != CONFIG_COMMAND {
            return self.reject_negotiation(channel, ServerError::ExpectingConfigRequest, session);
        }
        let config = match decode_config(payload.as_bytes()) {
            Ok(config) => config,
            Err(error) => return self.reject_negotiation(channel, error, session),
        };
        if config.version != BUILD_VERSION {
            let version = if config.version.is_empty() {
                "<unknown>"
            } else {
                config.version.as_str()
            };
            info!(
                "Client version ({}) differs from server version ({})",
                version, BUILD_VERSION
            );
        }
        if let Some(ref user) = self.user {
            if let Err(denial) = self.server.auth.check_remotes(user, &config.remotes) {
                return self.reject_negotiation(channel, denial, session);
            }
        }
        self.negotiation_timer = None;
        self.negotiated = true;
        debug!("session#{}: configuration accepted", self.id);
        session.channel_success(channel)
    }

    // Reply with the reason, then disconnect. Both messages flush in
    // order before the transport goes down.
    fn reject_negotiation(
        &mut self,
        channel: ChannelId,
        reason: ServerError,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        debug!("session#{}: negotiation failed: {}", self.id, reason);
        let _ = session.data(channel, CryptoVec::from_slice(reason.to_string().as_bytes()));
        let result = session.channel_failure(channel);
        let _ = session.disconnect(Disconnect::ByApplication, "", "");
        result
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Point clients at password authentication.
    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
            partial_success: false,
        })
    }

    // Verify credentials against the user table and bind the session
    // to the matched user. An empty table accepts anyone.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.server.auth.authenticate(self.id, user, password) {
            AuthOutcome::Unrestricted => Ok(Auth::Accept),
            AuthOutcome::Bound(bound) => {
                debug!(
                    "session#{} ({}): authenticated as {}",
                    self.id, self.peer, bound.name
                );
                self.user = Some(bound);
                Ok(Auth::Accept)
            }
            AuthOutcome::Denied => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    // Start the configuration deadline once the handshake completes.
    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        let token = self.cancellation_token.clone();
        let deadline = self.server.negotiation_timeout;
        let id = self.id;
        self.negotiation_timer = Some(DroppableHandle(tokio::spawn(async move {
            sleep(deadline).await;
            debug!("session#{}: no configuration before deadline, closing", id);
            token.cancel();
        })));
        Ok(())
    }

    // Accept the control channel carrying configuration and keepalive
    // requests.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    // Requests on the control channel. The first one must carry the
    // tunnel configuration; afterwards only keepalives are answered.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = String::from_utf8_lossy(data);
        let (request_type, payload) = match request.split_once(' ') {
            Some((request_type, payload)) => (request_type, payload),
            None => (request.as_ref(), ""),
        };
        if !self.negotiated {
            return self.negotiate(channel, request_type, payload, session).await;
        }
        match request_type {
            PING_COMMAND => session.channel_success(channel),
            unknown => {
                debug!("session#{}: unknown request: {}", self.id, unknown);
                session.channel_failure(channel)
            }
        }
    }

    // Classify each incoming channel by its requested host: the
    // literal `socks` asks for a SOCKS5 stream, anything else is a
    // `host:port` the server dials on the client's behalf. Every
    // accepted channel runs on its own task.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.negotiated {
            debug!(
                "session#{}: denied channel before configuration",
                self.id
            );
            return Ok(false);
        }
        if host_to_connect == SOCKS_KEY {
            if self.server.socks.is_none() {
                debug!(
                    "session#{}: denied SOCKS5 channel: SOCKS5 is not enabled on the server",
                    self.id
                );
                return Ok(false);
            }
            self.channel_count += 1;
            let conn_id = self.channel_count;
            let session_id = self.id;
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                let Some(ref socks) = server.socks else { return };
                debug!("session#{} socks#{}: open", session_id, conn_id);
                match socks.serve(channel.into_stream()).await {
                    Ok(_) => debug!("session#{} socks#{}: closed", session_id, conn_id),
                    Err(error) => {
                        debug!("session#{} socks#{}: error: {}", session_id, conn_id, error)
                    }
                }
            });
            return Ok(true);
        }
        let remote = format!("{}:{}", host_to_connect, port_to_connect);
        self.channel_count += 1;
        let conn_id = self.channel_count;
        let session_id = self.id;
        tokio::spawn(async move {
            match TcpStream::connect(&remote).await {
                Err(error) => {
                    debug!(
                        "session#{} tcp#{}: remote {} ({})",
                        session_id, conn_id, remote, error
                    );
                    let _ = channel.close().await;
                }
                Ok(target) => {
                    debug!("session#{} tcp#{}: open", session_id, conn_id);
                    let (sent, received) = pipe(channel.into_stream(), target).await;
                    debug!(
                        "session#{} tcp#{}: closed (sent {} received {})",
                        session_id, conn_id, sent, received
                    );
                }
            }
        });
        Ok(true)
    }
}
