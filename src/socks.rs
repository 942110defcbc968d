use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::pump::pipe;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTHENTICATION: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;
const CONNECT_COMMAND: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

// In-process SOCKS5 endpoint. It owns no listener; streams are handed
// to it directly, so tunneled SSH channels are served the same way a
// TCP socket would be.
#[derive(Debug, Default)]
pub(crate) struct Socks5Server;

impl Socks5Server {
    pub(crate) fn new() -> Self {
        Socks5Server
    }

    // Drive one SOCKS5 session on the given stream: negotiate no-auth,
    // read a CONNECT request, dial the destination, then bridge bytes
    // until either side closes.
    pub(crate) async fn serve<S>(&self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        // Method negotiation: VER NMETHODS METHODS...
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unsupported SOCKS version",
            ));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;
        if !methods.contains(&NO_AUTHENTICATION) {
            stream
                .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
                .await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no acceptable authentication method",
            ));
        }
        stream.write_all(&[SOCKS_VERSION, NO_AUTHENTICATION]).await?;

        // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        if request[0] != SOCKS_VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unsupported SOCKS version",
            ));
        }
        if request[1] != CONNECT_COMMAND {
            reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unsupported SOCKS command",
            ));
        }
        let destination = match request[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                format!("{}:{}", Ipv4Addr::from(addr), port)
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                stream.read_exact(&mut name).await?;
                let name = String::from_utf8_lossy(&name).into_owned();
                let port = read_port(&mut stream).await?;
                format!("{}:{}", name, port)
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                format!("[{}]:{}", Ipv6Addr::from(addr), port)
            }
            _ => {
                reply(&mut stream, REP_ADDRESS_TYPE_NOT_SUPPORTED).await?;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unsupported address type",
                ));
            }
        };

        let target = match TcpStream::connect(&destination).await {
            Ok(target) => target,
            Err(error) => {
                debug!("SOCKS5 dial to {} failed: {}", destination, error);
                reply(&mut stream, REP_HOST_UNREACHABLE).await?;
                return Err(error);
            }
        };
        match target.local_addr() {
            Ok(bound) => reply_bound(&mut stream, bound).await?,
            Err(_) => reply(&mut stream, REP_GENERAL_FAILURE).await?,
        }

        let (sent, received) = pipe(stream, target).await;
        debug!(
            "SOCKS5 session to {} done (sent {} received {})",
            destination, sent, received
        );
        Ok(())
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

// Error reply with a zeroed IPv4 bind address.
async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

// Success reply carrying the address our end of the dialed socket
// bound to.
async fn reply_bound<S: AsyncWrite + Unpin>(
    stream: &mut S,
    bound: SocketAddr,
) -> std::io::Result<()> {
    let mut response = vec![SOCKS_VERSION, REP_SUCCEEDED, 0];
    match bound {
        SocketAddr::V4(addr) => {
            response.push(ATYP_IPV4);
            response.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            response.push(ATYP_IPV6);
            response.extend_from_slice(&addr.ip().octets());
        }
    }
    response.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&response).await
}
