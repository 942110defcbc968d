use std::{sync::Arc, time::Duration};

use borehole::{
    entrypoint,
    protocol::{BUILD_VERSION, PROTOCOL_VERSION},
    ws::WsStream,
    ApplicationConfig,
};
use russh::ChannelMsg;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_tungstenite::{client_async, tungstenite::client::IntoClientRequest};

#[tokio::test(flavor = "multi_thread")]
async fn tunnel_tcp_forward() {
    // 1. Initialize Borehole without authentication
    let config = ApplicationConfig {
        listen_address: "127.0.0.1".into(),
        port: 28102,
        key_seed: None,
        auth_file: None,
        auth: None,
        proxy: None,
        socks5: false,
        negotiation_timeout: 10,
    };
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:28102").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Borehole to start.")
    };

    // 2. Start the echo service the tunnel should reach
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = echo.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    // 3. Upgrade to a WebSocket and handshake SSH over it
    let stream = TcpStream::connect("127.0.0.1:28102")
        .await
        .expect("Failed to connect to HTTP port");
    let mut request = "ws://127.0.0.1:28102/"
        .into_client_request()
        .expect("Invalid WebSocket request");
    request.headers_mut().insert(
        "sec-websocket-protocol",
        PROTOCOL_VERSION.parse().unwrap(),
    );
    let (websocket, _) = client_async(request, stream)
        .await
        .expect("WebSocket upgrade failed");
    let mut session = russh::client::connect_stream(
        Arc::new(russh::client::Config::default()),
        WsStream::new(websocket),
        TunnelClient,
    )
    .await
    .expect("Failed to connect to SSH server");
    let auth = session
        .authenticate_password("anonymous", "anything")
        .await
        .expect("SSH authentication errored");
    assert!(auth.success(), "authentication should be disabled");

    // 4. Send the tunnel configuration and await its reply
    let mut channel = session
        .channel_open_session()
        .await
        .expect("Failed to open control channel");
    let tunnel_config = serde_json::json!({
        "version": BUILD_VERSION,
        "remotes": [{"remote_host": "127.0.0.1", "remote_port": echo_port.to_string()}],
    });
    channel
        .exec(true, format!("config {}", tunnel_config))
        .await
        .expect("Failed to send configuration");
    let accepted = timeout(Duration::from_secs(5), async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break true,
                Some(ChannelMsg::Failure) => break false,
                Some(_) => continue,
                None => panic!("Control channel closed before reply"),
            }
        }
    })
    .await
    .expect("Timeout waiting for configuration reply");
    assert!(accepted, "configuration should be accepted");

    // 5. Keepalives are answered after configuration
    channel.exec(true, "ping").await.expect("Failed to ping");
    let ponged = timeout(Duration::from_secs(5), async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break true,
                Some(ChannelMsg::Failure) => break false,
                Some(_) => continue,
                None => panic!("Control channel closed before ping reply"),
            }
        }
    })
    .await
    .expect("Timeout waiting for ping reply");
    assert!(ponged, "ping should be replied to");

    // 6. Open a forward to the echo service and bridge bytes
    let forward = session
        .channel_open_direct_tcpip("127.0.0.1", echo_port.into(), "127.0.0.1", 0)
        .await
        .expect("Failed to open forward channel");
    let mut forward = forward.into_stream();
    forward
        .write_all(b"hello through the tunnel")
        .await
        .expect("Failed to write to forward");
    let mut buffer = [0u8; 24];
    timeout(Duration::from_secs(5), forward.read_exact(&mut buffer))
        .await
        .expect("Timeout waiting for echo")
        .expect("Failed to read echo");
    assert_eq!(&buffer, b"hello through the tunnel");
}

struct TunnelClient;

impl russh::client::Handler for TunnelClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
