//! 入站服务
//!
//! 每个服务监听一个地址，解析入站协议得到目的地址，
//! 按当前快照中的路由拨号后双向转发。

mod http;
mod socks5;
mod udp;

use crate::config::ServiceConfig;
use crate::connector::socks5::read_address;
use crate::connector::Credentials;
use crate::error::TunnelError;
use crate::node::NodeSpec;
use crate::rate_limiter::RateLimiter;
use crate::relay::relay;
use crate::reload::{ConfigHandle, Snapshot};
use crate::transport::BoxedTransport;
use anyhow::{bail, Context, Result};
use http::HttpInbound;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use udp::DatagramMode;

/// 入站协议
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    Socks5,
    Http,
    /// 不加密的 Shadowsocks（`none` 加密方式），流开头是 SOCKS5 格式的目的地址
    Shadowsocks,
    /// 端口转发到固定远端
    Forward { remote: String },
}

impl ServiceKind {
    /// 由监听地址确定入站协议
    pub fn from_spec(spec: &NodeSpec) -> Result<Self> {
        if spec.transport != "tcp" {
            bail!("Listening over '{}' transport is not supported", spec.transport);
        }
        match spec.protocol.as_str() {
            "socks5" | "socks" => Ok(ServiceKind::Socks5),
            "http" => Ok(ServiceKind::Http),
            "ss" | "shadowsocks" => {
                let method = spec.auth.as_ref().map(|a| a.username.as_str()).unwrap_or("none");
                if !matches!(method, "none" | "plain") {
                    bail!("Shadowsocks cipher '{}' is not supported, only 'none'", method);
                }
                Ok(ServiceKind::Shadowsocks)
            }
            "tcp" | "forward" => match spec.remote {
                Some(ref remote) => Ok(ServiceKind::Forward {
                    remote: remote.clone(),
                }),
                None => bail!(
                    "Forward service requires a remote address, e.g. tcp://:2222/10.0.0.5:22"
                ),
            },
            other => bail!("Unsupported service protocol '{}'", other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Socks5 => "socks5",
            ServiceKind::Http => "http",
            ServiceKind::Shadowsocks => "ss",
            ServiceKind::Forward { .. } => "tcp",
        }
    }
}

/// 每个连接共享的服务参数
#[derive(Debug)]
struct ServiceContext {
    name: String,
    kind: ServiceKind,
    auth: Option<Credentials>,
}

/// 已绑定监听地址的服务
pub struct Service {
    context: Arc<ServiceContext>,
    listener: TcpListener,
    handle: ConfigHandle,
    limiter: Option<RateLimiter>,
    max_connections: usize,
}

impl Service {
    /// 解析监听地址并绑定
    pub async fn bind(config: &ServiceConfig, handle: ConfigHandle) -> Result<Self> {
        let spec = NodeSpec::parse(&config.listen)
            .with_context(|| format!("Service '{}': invalid listen address", config.name))?;
        let kind = ServiceKind::from_spec(&spec)
            .with_context(|| format!("Service '{}'", config.name))?;
        let limiter = config.rate_limit.map(RateLimiter::new).transpose()?;

        let bind_addr = spec.addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind service '{}' to {}", config.name, bind_addr))?;

        info!(
            "Service '{}' ({}) listening on {}",
            config.name,
            kind.name(),
            listener.local_addr()?
        );

        Ok(Self {
            context: Arc::new(ServiceContext {
                name: config.name.clone(),
                kind,
                auth: spec.auth.clone(),
            }),
            listener,
            handle,
            limiter,
            max_connections: config.max_connections.max(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.context.kind
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接直到 `shutdown` 被触发
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let connection_limiter = Arc::new(Semaphore::new(self.max_connections));
        let name = self.context.name.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Service '{}' shutting down", name);
                    break Ok(());
                }
                accept_result = self.listener.accept() => {
                    let (stream, peer_addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Service '{}': accept error: {}", name, e);
                            sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    if let Some(ref limiter) = self.limiter {
                        if limiter.check().is_err() {
                            debug!(
                                "Service '{}': rate limited connection from {}",
                                name, peer_addr
                            );
                            continue;
                        }
                    }

                    let permit = match connection_limiter.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                "Service '{}': connection limit reached ({}), rejecting {}",
                                name, self.max_connections, peer_addr
                            );
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }

                    // 连接使用接受时的快照，热加载不影响进行中的连接
                    let snapshot = self.handle.load();
                    let context = self.context.clone();
                    let cancel = shutdown.child_token();
                    let span = info_span!(
                        "conn",
                        id = %uuid::Uuid::new_v4(),
                        service = %context.name,
                        peer = %peer_addr
                    );

                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            handle_connection(stream, context, snapshot, cancel).await;
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("context", &self.context)
            .field("local_addr", &self.listener.local_addr().ok())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// 已解析的入站请求，拨号完成后按协议回复
enum Inbound {
    Socks5 { target: String },
    Socks5Datagram(DatagramMode),
    Http(HttpInbound),
    /// Shadowsocks 与端口转发都不需要回复
    Silent { target: String },
}

impl Inbound {
    fn target(&self) -> &str {
        match self {
            Inbound::Socks5 { target } | Inbound::Silent { target } => target,
            Inbound::Socks5Datagram(_) => "udp",
            Inbound::Http(inbound) => inbound.target(),
        }
    }

    async fn succeed(
        &self,
        client: &mut TcpStream,
        remote: &mut BoxedTransport,
    ) -> std::io::Result<()> {
        match self {
            Inbound::Socks5 { .. } => socks5::send_reply(client, socks5::REPLY_SUCCEEDED).await,
            Inbound::Http(HttpInbound::Connect { .. }) => http::send_established(client).await,
            Inbound::Http(HttpInbound::Forward { head, .. }) => {
                remote.write_all(head).await?;
                remote.flush().await
            }
            Inbound::Socks5Datagram(_) | Inbound::Silent { .. } => Ok(()),
        }
    }

    async fn fail(&self, client: &mut TcpStream, err: &TunnelError) {
        let result = match self {
            Inbound::Socks5 { .. } | Inbound::Socks5Datagram(_) => {
                socks5::send_reply(client, socks5::failure_code(err)).await
            }
            Inbound::Http(_) => http::send_bad_gateway(client).await,
            Inbound::Silent { .. } => Ok(()),
        };
        if let Err(e) = result {
            debug!("Failed to send failure reply: {}", e);
        }
    }
}

async fn read_inbound(stream: &mut TcpStream, context: &ServiceContext) -> Result<Inbound> {
    match context.kind {
        ServiceKind::Socks5 => match socks5::accept(stream, context.auth.as_ref()).await? {
            socks5::Command::Connect(target) => Ok(Inbound::Socks5 { target }),
            socks5::Command::UdpAssociate => Ok(Inbound::Socks5Datagram(DatagramMode::Associate)),
            socks5::Command::UdpTunnel => Ok(Inbound::Socks5Datagram(DatagramMode::Tunnel)),
        },
        ServiceKind::Http => Ok(Inbound::Http(
            http::accept(stream, context.auth.as_ref()).await?,
        )),
        ServiceKind::Shadowsocks => {
            let atyp = stream.read_u8().await?;
            let target = read_address(stream, atyp).await?;
            Ok(Inbound::Silent { target })
        }
        ServiceKind::Forward { ref remote } => Ok(Inbound::Silent {
            target: remote.clone(),
        }),
    }
}

/// 客户端关闭连接（读到 EOF）时完成；客户端已发送数据时一直挂起
async fn client_closed(stream: &TcpStream) {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}

/// 拨号期间客户端关闭连接时取消拨号，被丢弃的拨号不上报健康状态
async fn dial_or_abandon<T>(
    stream: &TcpStream,
    dial: impl Future<Output = crate::error::Result<T>>,
    cancel: &CancellationToken,
) -> crate::error::Result<T> {
    tokio::select! {
        result = dial => result,
        _ = client_closed(stream) => {
            cancel.cancel();
            Err(TunnelError::Cancelled)
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    context: Arc<ServiceContext>,
    snapshot: Arc<Snapshot>,
    cancel: CancellationToken,
) {
    let parse_timeout = snapshot.parse_timeout();
    let inbound = match timeout(parse_timeout, read_inbound(&mut stream, &context)).await {
        Ok(Ok(inbound)) => inbound,
        Ok(Err(e)) => {
            debug!("Rejected inbound request: {:#}", e);
            return;
        }
        Err(_) => {
            debug!("Inbound request not received within {:?}", parse_timeout);
            return;
        }
    };
    let Some(route) = snapshot.route(&context.name) else {
        warn!("No route for service '{}' in current configuration", context.name);
        inbound
            .fail(&mut stream, &TunnelError::config_error("missing route"))
            .await;
        return;
    };

    if let Inbound::Socks5Datagram(mode) = inbound {
        let dial = route.dial_datagram(snapshot.dialer(), &cancel);
        let tunnel = match dial_or_abandon(&stream, dial, &cancel).await {
            Ok(tunnel) => tunnel,
            Err(e) if e.is_cancelled() => {
                debug!("UDP tunnel dial cancelled");
                return;
            }
            Err(e) => {
                error!("Failed to open UDP tunnel: {}", e);
                udp::reject(&mut stream, &e).await;
                return;
            }
        };
        let served = match mode {
            DatagramMode::Associate => udp::associate(stream, tunnel).await,
            DatagramMode::Tunnel => udp::tunnel(stream, tunnel).await,
        };
        if let Err(e) = served {
            debug!("UDP relay ended: {:#}", e);
        }
        return;
    }

    let target = inbound.target().to_string();
    let dial = route.dial(snapshot.dialer(), &target, &cancel);
    let mut remote = match dial_or_abandon(&stream, dial, &cancel).await {
        Ok(remote) => remote,
        Err(e) if e.is_cancelled() => {
            debug!("Dial to {} cancelled", target);
            return;
        }
        Err(e) => {
            error!("Failed to connect to {}: {}", target, e);
            inbound.fail(&mut stream, &e).await;
            return;
        }
    };

    if let Err(e) = inbound.succeed(&mut stream, &mut remote).await {
        debug!("Failed to complete inbound handshake: {}", e);
        return;
    }

    info!("Connected to {}", target);
    let stats = relay(stream, remote, snapshot.idle_timeout()).await;
    info!(
        "Connection to {} closed (sent {} bytes, received {} bytes)",
        target, stats.sent, stats.received
    );
}
