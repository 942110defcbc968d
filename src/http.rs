use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use bytes::Bytes;
use http::{
    header::{CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE},
    uri::Scheme,
    HeaderValue, Uri,
};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{body::Incoming, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use rustls_platform_verifier::ConfigVerifierExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::{error::ServerError, protocol::PROTOCOL_VERSION, tunnel::serve_tunnel, BoreholeServer};

pub(crate) type HttpBody = BoxBody<Bytes, hyper::Error>;

// Classify each HTTP request on the shared listener: a tunnel upgrade,
// a reverse-proxied request, or a plain 404.
pub(crate) async fn dispatch(
    server: Arc<BoreholeServer>,
    request: Request<Incoming>,
    peer: SocketAddr,
) -> anyhow::Result<Response<HttpBody>> {
    if is_tunnel_upgrade(&request) {
        return upgrade_tunnel(server, request, peer);
    }
    if let Some(ref proxy) = server.proxy {
        return proxy.forward(request).await;
    }
    not_found()
}

// A tunnel request is a WebSocket upgrade presenting our protocol
// token. Origin is deliberately not checked; the tunnel authenticates
// at the SSH layer.
fn is_tunnel_upgrade<B>(request: &Request<B>) -> bool {
    let upgrade = request
        .headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let protocol = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    upgrade.eq_ignore_ascii_case("websocket") && protocol == PROTOCOL_VERSION
}

// Complete the WebSocket handshake and hand the upgraded byte stream
// to the tunnel session on its own task.
fn upgrade_tunnel(
    server: Arc<BoreholeServer>,
    mut request: Request<Incoming>,
    peer: SocketAddr,
) -> anyhow::Result<Response<HttpBody>> {
    let key = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(ServerError::MissingWebSocketKey)?;
    let accept_key = derive_accept_key(key.as_bytes());
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut request).await {
            Ok(upgraded) => serve_tunnel(server, TokioIo::new(upgraded), peer).await,
            Err(error) => debug!("Failed to upgrade connection from {} ({})", peer, error),
        }
    });
    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .header(SEC_WEBSOCKET_PROTOCOL, PROTOCOL_VERSION)
        .body(Empty::new().map_err(|never| match never {}).boxed())?)
}

fn not_found() -> anyhow::Result<Response<HttpBody>> {
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(b"Not found"))
            .map_err(|never| match never {})
            .boxed())?)
}

enum ProxyScheme {
    Http,
    Https(Arc<ClientConfig>),
}

// Parsed data for the reverse-proxy upstream, consulted on every
// proxied request.
pub(crate) struct ReverseProxy {
    // Address and port to dial.
    address: String,
    // Replacement for the Host header.
    authority: HeaderValue,
    // Which scheme to connect with (HTTP or HTTPS).
    scheme: ProxyScheme,
    // Which server name to specify for TLS requests.
    server_name: ServerName<'static>,
}

impl ReverseProxy {
    pub(crate) fn new(target: &str) -> anyhow::Result<Self> {
        let url: Uri = target
            .parse()
            .with_context(|| "Invalid reverse proxy URL")?;
        let scheme = url.scheme().ok_or(ServerError::MissingProxyScheme)?.clone();
        let scheme = if scheme == Scheme::HTTP {
            ProxyScheme::Http
        } else if scheme == Scheme::HTTPS {
            ProxyScheme::Https(Arc::new(ClientConfig::with_platform_verifier()?))
        } else {
            return Err(ServerError::UnknownProxyScheme.into());
        };
        let authority = url
            .authority()
            .ok_or(ServerError::MissingProxyHost)?
            .clone();
        let host = url.host().ok_or(ServerError::MissingProxyHost)?.to_string();
        let server_name = ServerName::try_from(host.clone())
            .with_context(|| "Invalid server name in reverse proxy URL")?;
        let address = format!(
            "{}:{}",
            host,
            url.port_u16().unwrap_or(match scheme {
                ProxyScheme::Http => 80,
                ProxyScheme::Https(_) => 443,
            })
        );
        Ok(ReverseProxy {
            address,
            authority: authority.as_str().parse()?,
            scheme,
            server_name,
        })
    }

    // Forward a request verbatim to the upstream, swapping only the
    // target of the URL and the Host header. Path and query are never
    // altered.
    pub(crate) async fn forward(
        &self,
        mut request: Request<Incoming>,
    ) -> anyhow::Result<Response<HttpBody>> {
        let path = request
            .uri()
            .path_and_query()
            .map(|path| path.as_str().to_owned())
            .unwrap_or_else(|| String::from("/"));
        *request.uri_mut() = path
            .parse()
            .with_context(|| "Invalid path in proxied request")?;
        request.headers_mut().insert(HOST, self.authority.clone());

        let stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| "Reverse proxy connection failed")?;
        let response = match self.scheme {
            ProxyScheme::Http => send_upstream(request, TokioIo::new(stream)).await?,
            ProxyScheme::Https(ref config) => {
                let connector = TlsConnector::from(Arc::clone(config));
                let tls_stream = connector
                    .connect(self.server_name.clone(), stream)
                    .await
                    .with_context(|| "Reverse proxy TLS connection failed")?;
                send_upstream(request, TokioIo::new(tls_stream)).await?
            }
        };
        Ok(response.map(|body| body.boxed()))
    }
}

async fn send_upstream<T>(
    request: Request<Incoming>,
    io: TokioIo<T>,
) -> anyhow::Result<Response<Incoming>>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .with_context(|| "Reverse proxy handshake failed")?;
    // The connection task outlives the response so its body can
    // stream.
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            warn!("Reverse proxy connection errored: {:?}", error);
        }
    });
    sender
        .send_request(request)
        .await
        .with_context(|| "Reverse proxy request failed")
}
