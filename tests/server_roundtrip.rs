// tests/server_roundtrip.rs
//
// Ingestion server over real sockets: framed request/response, and the auth
// handshake in both outcomes.

use std::sync::Arc;

use tokio::net::TcpStream;

use txflow::auth::{AuthConfig, Authenticator};
use txflow::framing::{read_frame, write_frame};
use txflow::server::{BatchSink, IngestServer};

struct EchoSink;

impl BatchSink for EchoSink {
    fn process(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        if data == b"fail" {
            return Err("error: forced failure".to_string());
        }
        Ok(b"OK".to_vec())
    }
}

async fn start_server(auth: AuthConfig) -> (Arc<IngestServer>, std::net::SocketAddr) {
    let server = IngestServer::new(
        "127.0.0.1:0",
        Arc::new(Authenticator::new(auth)),
        Arc::new(EchoSink),
    );
    server.start().await.expect("server start");
    let addr = server.local_addr().expect("bound address");
    (server, addr)
}

#[tokio::test]
async fn framed_request_gets_ok_response() {
    let (server, addr) = start_server(AuthConfig::disabled()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, b"hello").await.unwrap();
    let response = read_frame(&mut conn).await.unwrap();
    assert_eq!(response, b"OK");

    // The connection stays usable for more requests.
    write_frame(&mut conn, b"again").await.unwrap();
    assert_eq!(read_frame(&mut conn).await.unwrap(), b"OK");

    server.stop().await;
}

#[tokio::test]
async fn sink_error_sends_diagnostic_then_closes() {
    let (server, addr) = start_server(AuthConfig::disabled()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, b"fail").await.unwrap();
    let response = read_frame(&mut conn).await.unwrap();
    assert_eq!(response, b"error: forced failure");

    // Server closed its side; the next read ends the stream.
    assert!(read_frame(&mut conn).await.is_err());

    server.stop().await;
}

#[tokio::test]
async fn auth_happy_path() {
    let (server, addr) = start_server(AuthConfig {
        enabled: true,
        token: "s3cret".to_string(),
    })
    .await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, br#"{"type":"auth","token":"s3cret"}"#)
        .await
        .unwrap();
    let response = read_frame(&mut conn).await.unwrap();
    assert_eq!(response, br#"{"success":true}"#);

    write_frame(&mut conn, b"payload").await.unwrap();
    assert_eq!(read_frame(&mut conn).await.unwrap(), b"OK");

    server.stop().await;
}

#[tokio::test]
async fn auth_wrong_token_is_refused_and_connection_closed() {
    let (server, addr) = start_server(AuthConfig {
        enabled: true,
        token: "s3cret".to_string(),
    })
    .await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, br#"{"type":"auth","token":"wrong"}"#)
        .await
        .unwrap();
    let response = read_frame(&mut conn).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.contains("\"success\":false"));

    // Anything sent afterwards lands on a closed connection.
    let _ = write_frame(&mut conn, b"payload").await;
    assert!(read_frame(&mut conn).await.is_err());

    server.stop().await;
}

#[tokio::test]
async fn auth_malformed_first_frame_is_refused() {
    let (server, addr) = start_server(AuthConfig {
        enabled: true,
        token: "s3cret".to_string(),
    })
    .await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, b"not an auth message").await.unwrap();
    let response = read_frame(&mut conn).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.contains("\"success\":false"));

    server.stop().await;
}

#[tokio::test]
async fn stop_refuses_new_connections() {
    let (server, addr) = start_server(AuthConfig::disabled()).await;
    server.stop().await;

    // Either the connect fails outright or the socket is dead on arrival.
    match TcpStream::connect(addr).await {
        Ok(mut conn) => {
            let _ = write_frame(&mut conn, b"hello").await;
            assert!(read_frame(&mut conn).await.is_err());
        }
        Err(_) => {}
    }
}
