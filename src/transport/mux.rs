use super::{BoxedTransport, Transporter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

/// 打开新子流的请求
type StreamRequest = oneshot::Sender<Result<yamux::Stream>>;

/// 单个 yamux 会话的句柄，会话由后台任务驱动
#[derive(Clone)]
struct MuxSession {
    stream_tx: mpsc::Sender<StreamRequest>,
}

impl MuxSession {
    /// 在 `conn` 上建立客户端 yamux 会话并启动驱动任务
    fn start(conn: BoxedTransport, addr: String) -> Self {
        let (stream_tx, mut stream_rx) = mpsc::channel::<StreamRequest>(64);
        let mut yamux_conn =
            YamuxConnection::new(conn.compat(), YamuxConfig::default(), YamuxMode::Client);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // 驱动连接；客户端不接受对端发起的子流
                    inbound = poll_fn(|cx| yamux_conn.poll_next_inbound(cx)) => {
                        match inbound {
                            Some(Ok(stream)) => {
                                debug!("Dropping unexpected inbound mux stream from {}", addr);
                                drop(stream);
                            }
                            Some(Err(e)) => {
                                warn!("Mux session to {} failed: {}", addr, e);
                                break;
                            }
                            None => {
                                info!("Mux session to {} closed by peer", addr);
                                break;
                            }
                        }
                    }
                    request = stream_rx.recv() => {
                        let Some(response_tx) = request else {
                            // 所有句柄与子流都已释放
                            debug!("Mux session to {} has no more users, closing", addr);
                            let _ = poll_fn(|cx| yamux_conn.poll_close(cx)).await;
                            break;
                        };
                        let stream_result = poll_fn(|cx| yamux_conn.poll_new_outbound(cx)).await;
                        let _ = response_tx.send(
                            stream_result
                                .map_err(|e| anyhow::anyhow!("Failed to create mux stream: {}", e)),
                        );
                    }
                }
            }
        });

        Self { stream_tx }
    }

    fn is_closed(&self) -> bool {
        self.stream_tx.is_closed()
    }

    async fn open_stream(&self) -> Result<BoxedTransport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.stream_tx
            .send(response_tx)
            .await
            .map_err(|_| anyhow::anyhow!("Mux session closed"))?;
        let stream = response_rx
            .await
            .context("Mux session dropped the stream request")??;
        Ok(Box::pin(MuxStream {
            inner: stream.compat(),
            _session: self.clone(),
        }))
    }
}

/// yamux 子流，持有会话句柄使会话在子流存活期间保持运行
struct MuxStream {
    inner: Compat<yamux::Stream>,
    _session: MuxSession,
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 多路复用传输（mtcp / mtls）
///
/// 在内层传输（tcp 或 tls）之上建立 yamux 会话，每次拨号打开一个子流。
/// 直接拨号时复用同一个会话；经过上一跳拨号时每次建立独立会话
pub struct MuxTransporter {
    inner: Arc<dyn Transporter>,
    name: &'static str,
    session: tokio::sync::Mutex<Option<MuxSession>>,
}

impl MuxTransporter {
    pub fn new(inner: Arc<dyn Transporter>, name: &'static str) -> Self {
        Self {
            inner,
            name,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// 获取缓存的会话，失效时重新建立
    async fn shared_session(&self, addr: &str) -> Result<MuxSession> {
        let mut guard = self.session.lock().await;
        if let Some(ref session) = *guard {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!("Cached mux session to {} is closed, reconnecting", addr);
        }

        let conn = self.inner.dial(addr, None).await?;
        let session = MuxSession::start(conn, addr.to_string());
        info!("Mux session established to {} over {}", addr, self.inner.name());
        *guard = Some(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl Transporter for MuxTransporter {
    async fn dial(
        &self,
        addr: &str,
        underlying: Option<BoxedTransport>,
    ) -> Result<BoxedTransport> {
        match underlying {
            Some(conn) => {
                let conn = self.inner.dial(addr, Some(conn)).await?;
                let session = MuxSession::start(conn, addr.to_string());
                session.open_stream().await
            }
            None => {
                let session = self.shared_session(addr).await?;
                match session.open_stream().await {
                    Ok(stream) => Ok(stream),
                    Err(e) => {
                        // 会话可能已失效，清除缓存后重试一次
                        warn!("Mux stream to {} failed ({}), retrying with new session", addr, e);
                        self.session.lock().await.take();
                        let session = self.shared_session(addr).await?;
                        session.open_stream().await
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_multiplexed(&self) -> bool {
        true
    }
}
