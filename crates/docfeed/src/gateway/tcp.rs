//! Live gateway connection over TCP.
//!
//! The connection is opened lazily on the first send and reopened on the next send after a
//! failure. Writes are pipelined: a batch is written as one or more request frames and the
//! call returns without waiting for replies. A reader task per link decodes reply frames and
//! hands each result to the [`ReplySink`]. Operations written on a link that later dies get no
//! reply and are left to the result timeout.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::wire::{self, FrameKind};
use super::{
    GatewayConnection, GatewayConnector, Reply, ReplySink, ReplyStatus, WireOperation,
};
use crate::config::{ConnectionParams, Endpoint};
use crate::error::{FeedError, Result};

const READER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct Link {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }
}

/// A pipelined connection to one gateway endpoint.
pub struct TcpGatewayConnection {
    endpoint: Endpoint,
    route: Option<String>,
    params: ConnectionParams,
    max_chunk_size_bytes: usize,
    sink: Arc<dyn ReplySink>,
    link: Mutex<Option<Link>>,
    next_batch_id: AtomicU32,
    closed: AtomicBool,
}

impl TcpGatewayConnection {
    /// Creates an unconnected connection; nothing is dialled until the first send.
    pub fn new(
        endpoint: Endpoint,
        route: Option<String>,
        params: ConnectionParams,
        max_chunk_size_bytes: usize,
        sink: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            endpoint,
            route,
            params,
            max_chunk_size_bytes: max_chunk_size_bytes.max(1),
            sink,
            link: Mutex::new(None),
            next_batch_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    async fn open(&self) -> Result<Link> {
        let addr = self.endpoint.address();
        let stream = tokio::time::timeout(self.params.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| FeedError::ConnectionTimeout {
                endpoint: addr.clone(),
                timeout_ms: self.params.connect_timeout_ms,
            })?
            .map_err(|e| FeedError::ConnectionFailed {
                endpoint: addr.clone(),
                reason: e.to_string(),
            })?;
        if self.params.nodelay {
            stream.set_nodelay(true)?;
        }
        info!(endpoint = %self.endpoint, "gateway connection established");
        let (read, writer) = stream.into_split();
        let reader = tokio::spawn(read_replies(
            read,
            Arc::clone(&self.sink),
            self.endpoint.to_string(),
        ));
        Ok(Link { writer, reader })
    }

    async fn write_chunks(
        &self,
        writer: &mut OwnedWriteHalf,
        batch: &[WireOperation],
    ) -> Result<()> {
        for chunk in wire::chunks(batch, self.max_chunk_size_bytes) {
            let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
            let frame = wire::encode_request_frame(batch_id, chunk, self.route.as_deref())?;
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl GatewayConnection for TcpGatewayConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send_batch(&self, batch: &[WireOperation]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FeedError::NotConnected);
        }
        let route = self.route.as_deref();
        let oversized = batch.iter().any(|op| !wire::fits_in_frame(op, route));
        let sendable: Vec<WireOperation>;
        let batch = if oversized {
            let (fit, rejected): (Vec<_>, Vec<_>) = batch
                .iter()
                .cloned()
                .partition(|op| wire::fits_in_frame(op, route));
            for op in rejected {
                warn!(
                    endpoint = %self.endpoint,
                    id = %op.id,
                    bytes = op.size(),
                    "operation exceeds the frame limit"
                );
                self.sink.deliver(Reply {
                    id: op.id,
                    status: ReplyStatus::Permanent(format!(
                        "operation does not fit in a {} byte frame",
                        wire::MAX_FRAME_PAYLOAD
                    )),
                });
            }
            sendable = fit;
            &sendable[..]
        } else {
            batch
        };
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self.link.lock().await;
        if guard.as_ref().is_some_and(|link| !link.is_alive()) {
            debug!(endpoint = %self.endpoint, "reply stream ended, reconnecting");
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(link) = guard.as_mut() else {
            return Err(FeedError::NotConnected);
        };

        match self.write_chunks(&mut link.writer, batch).await {
            Ok(()) => Ok(()),
            Err(FeedError::Io(e)) => {
                if let Some(dead) = guard.take() {
                    dead.reader.abort();
                }
                Err(FeedError::ConnectionFailed {
                    endpoint: self.endpoint.address(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };
        let shutdown = link.writer.shutdown().await;
        if tokio::time::timeout(READER_SHUTDOWN_GRACE, &mut link.reader)
            .await
            .is_err()
        {
            link.reader.abort();
        }
        debug!(endpoint = %self.endpoint, "gateway connection closed");
        match shutdown {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_replies(mut read: OwnedReadHalf, sink: Arc<dyn ReplySink>, endpoint: String) {
    loop {
        match wire::read_frame(&mut read).await {
            Ok((header, body)) => {
                if header.kind != FrameKind::Reply {
                    warn!(%endpoint, kind = ?header.kind, "ignoring unexpected frame");
                    continue;
                }
                match wire::decode_replies(&body) {
                    Ok(replies) => {
                        for reply in replies {
                            sink.deliver(reply.into_reply());
                        }
                    }
                    Err(e) => {
                        warn!(%endpoint, error = %e, "undecodable reply frame, dropping link");
                        return;
                    }
                }
            }
            Err(FeedError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(%endpoint, "gateway closed the reply stream");
                return;
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "reply stream failed");
                return;
            }
        }
    }
}

/// Creates [`TcpGatewayConnection`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    params: ConnectionParams,
    max_chunk_size_bytes: usize,
}

impl TcpConnector {
    /// Connector using `params`, splitting batches into frames of at most `max_chunk_size_bytes`.
    pub fn new(params: ConnectionParams, max_chunk_size_bytes: usize) -> Self {
        Self {
            params,
            max_chunk_size_bytes,
        }
    }
}

impl GatewayConnector for TcpConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        route: Option<&str>,
        sink: Arc<dyn ReplySink>,
    ) -> Box<dyn GatewayConnection> {
        Box::new(TcpGatewayConnection::new(
            endpoint.clone(),
            route.map(str::to_string),
            self.params.clone(),
            self.max_chunk_size_bytes,
            sink,
        ))
    }
}
