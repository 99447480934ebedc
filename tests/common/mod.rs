//! Common utilities for integration tests
#![allow(dead_code)]

use chain_tunnel::config::AppConfig;
use chain_tunnel::registry::ProtocolRegistry;
use chain_tunnel::reload::{ConfigHandle, Snapshot};
use chain_tunnel::service::Service;
use futures::future::poll_fn;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// An address nothing listens on
pub fn unused_addr() -> String {
    format!("127.0.0.1:{}", get_available_port())
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// UDP echo server
pub async fn start_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind udp echo server");
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    addr
}

/// Server that accepts connections and never answers
///
/// Every connection closed by the peer is reported on the returned channel.
pub async fn start_blackhole_server() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind blackhole server");
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                let _ = closed_tx.send(());
            });
        }
    });

    (addr, closed_rx)
}

/// Minimal HTTP origin that answers every request with its request line
pub async fn start_http_origin() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind http origin");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let request_line = head.lines().next().unwrap_or_default().to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    request_line.len(),
                    request_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Start every service in `config` on its listen address
///
/// Listen addresses should use port 0; the bound addresses are returned in order.
pub async fn start_services(
    config: AppConfig,
) -> (Vec<SocketAddr>, ConfigHandle, CancellationToken) {
    let registry = ProtocolRegistry::with_builtins();
    let snapshot = Snapshot::build(&config, &registry, 1).expect("Failed to build snapshot");
    let handle = ConfigHandle::new(snapshot);
    let shutdown = CancellationToken::new();

    let mut addrs = Vec::new();
    for service_config in &config.services {
        let service = Service::bind(service_config, handle.clone())
            .await
            .expect("Failed to bind service");
        addrs.push(service.local_addr().unwrap());
        tokio::spawn(service.run(shutdown.child_token()));
    }

    (addrs, handle, shutdown)
}

fn tls_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("Failed to generate certificate");
    let cert = certified.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(certified.signing_key.serialize_der()),
    );
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("Failed to build server config");
    TlsAcceptor::from(Arc::new(config))
}

/// TLS terminator in front of `backend`, using a fresh self-signed certificate
pub async fn start_tls_terminator(backend: SocketAddr) -> SocketAddr {
    let acceptor = tls_acceptor();
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind tls terminator");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(socket).await else {
                    return;
                };
                let Ok(mut upstream) = TcpStream::connect(backend).await else {
                    return;
                };
                let _ = tokio::io::copy_bidirectional(&mut tls, &mut upstream).await;
            });
        }
    });

    addr
}

/// yamux server forwarding every stream to `backend`
async fn serve_mux<S>(io: S, backend: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn =
        yamux::Connection::new(io.compat(), yamux::Config::default(), yamux::Mode::Server);
    while let Some(Ok(stream)) = poll_fn(|cx| conn.poll_next_inbound(cx)).await {
        tokio::spawn(async move {
            let Ok(mut upstream) = TcpStream::connect(backend).await else {
                return;
            };
            let mut stream = stream.compat();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        });
    }
}

/// Multiplexing terminator in front of `backend`, optionally over TLS
pub async fn start_mux_terminator(backend: SocketAddr, tls: bool) -> SocketAddr {
    let acceptor = tls.then(tls_acceptor);
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mux terminator");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(socket).await {
                            serve_mux(tls, backend).await;
                        }
                    }
                    None => serve_mux(socket, backend).await,
                }
            });
        }
    });

    addr
}

/// Send `payload` and expect the same bytes back
pub async fn assert_echo<S>(stream: &mut S, payload: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

/// Issue an HTTP CONNECT and return the proxy's status line
pub async fn http_connect(stream: &mut TcpStream, target: &str) -> String {
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = timeout(Duration::from_secs(5), read_head(stream))
        .await
        .expect("CONNECT response timed out");
    head.lines().next().unwrap_or_default().to_string()
}

/// SOCKS5 CONNECT without authentication, returning the reply code
pub async fn socks5_connect(stream: &mut TcpStream, target: SocketAddr) -> u8 {
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    let SocketAddr::V4(v4) = target else {
        panic!("IPv4 target expected");
    };
    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(10), stream.read_exact(&mut reply))
        .await
        .expect("SOCKS5 reply timed out")
        .unwrap();
    reply[1]
}

/// SOCKS5 UDP ASSOCIATE without authentication, returning the reply code and relay address
pub async fn socks5_udp_associate(stream: &mut TcpStream) -> (u8, SocketAddr) {
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    stream
        .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(10), stream.read_exact(&mut reply))
        .await
        .expect("SOCKS5 reply timed out")
        .unwrap();
    let ip = Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    (reply[1], SocketAddr::from((ip, port)))
}

/// SOCKS5 UDP request header for an IPv4 `target` followed by `payload`
pub fn udp_packet(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let SocketAddr::V4(v4) = target else {
        panic!("IPv4 target expected");
    };
    let mut packet = vec![0, 0, 0, 1];
    packet.extend_from_slice(&v4.ip().octets());
    packet.extend_from_slice(&v4.port().to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Read up to and including the blank line ending an HTTP head
pub async fn read_head<S>(stream: &mut S) -> String
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}
