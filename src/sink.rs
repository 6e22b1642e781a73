use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::protocol::ServerLine;

/// One queue entry. A batch takes a single slot and is written as
/// consecutive lines.
#[derive(Debug)]
enum Outbound {
    Line(ServerLine),
    Batch(Vec<ServerLine>),
}

impl Outbound {
    fn encode(&self) -> String {
        match self {
            Outbound::Line(line) => format!("{line}\n"),
            Outbound::Batch(lines) => lines.iter().map(|line| format!("{line}\n")).collect(),
        }
    }
}

/// Where lines addressed to one session go.
///
/// A sink is the sending half of a bounded queue drained by the
/// session's writer task. `send` waits for room, at most `timeout`.
/// `deliver_all` never waits and is what runs under the registry lock.
/// A recipient that cannot take a line in either way is evicted: its
/// writer stops, which ends the session and announces its departure.
#[derive(Debug, Clone)]
pub struct Sink {
    tx: mpsc::Sender<Outbound>,
    evict: Arc<Notify>,
    timeout: Duration,
}

/// The receiving end of a sink, consumed by `spawn_writer`.
pub struct Outlet {
    rx: mpsc::Receiver<Outbound>,
    evict: Arc<Notify>,
}

impl Sink {
    pub fn channel(capacity: usize, timeout: Duration) -> (Self, Outlet) {
        let (tx, rx) = mpsc::channel(capacity);
        let evict = Arc::new(Notify::new());
        (
            Self {
                tx,
                evict: Arc::clone(&evict),
                timeout,
            },
            Outlet { rx, evict },
        )
    }

    /// Queue a line, waiting for room for at most the sink's timeout.
    pub async fn send(&self, line: ServerLine) -> Result<(), DeliveryError> {
        match self.tx.send_timeout(Outbound::Line(line), self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.evict();
                Err(DeliveryError::Lagging)
            }
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Queue `lines` as one entry without waiting.
    pub fn deliver_all(&self, lines: Vec<ServerLine>) -> Result<(), DeliveryError> {
        if lines.is_empty() {
            return Ok(());
        }
        match self.tx.try_send(Outbound::Batch(lines)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.evict();
                Err(DeliveryError::Lagging)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Wait for one free slot, so a later batch can be queued while a
    /// lock is held without any chance of failing.
    pub async fn reserve(&self) -> Result<Slot<'_>, DeliveryError> {
        match time::timeout(self.timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => Ok(Slot { permit }),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => {
                self.evict();
                Err(DeliveryError::Lagging)
            }
        }
    }

    /// Stop the writer task; queued lines are discarded.
    pub fn evict(&self) {
        self.evict.notify_one();
    }

    /// Resolves once the writer task has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// A reserved queue slot.
pub struct Slot<'a> {
    permit: mpsc::Permit<'a, Outbound>,
}

impl Slot<'_> {
    pub fn send_all(self, lines: Vec<ServerLine>) {
        self.permit.send(Outbound::Batch(lines));
    }
}

/// Drain a session's queue onto its socket.
///
/// Each write is bounded by `write_timeout`. The task exits on a failed
/// or timed out write, on eviction, or once every sink is dropped. On
/// exit the queue is closed for every holder and the write half is shut
/// down.
pub fn spawn_writer<W>(
    outlet: Outlet,
    mut writer: W,
    write_timeout: Duration,
    peer: SocketAddr,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Outlet { mut rx, evict } = outlet;
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                () = evict.notified() => {
                    warn!(%peer, "peer is not keeping up, dropping it");
                    break;
                }
                next = rx.recv() => next,
            };
            let Some(outbound) = next else {
                break;
            };

            let text = outbound.encode();
            match time::timeout(write_timeout, writer.write_all(text.as_bytes())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "write failed");
                    break;
                }
                Err(_) => {
                    warn!(%peer, timeout = ?write_timeout, "write timed out, dropping peer");
                    break;
                }
            }
        }
        rx.close();
        let _ = writer.shutdown().await;
    })
}

#[cfg(test)]
impl Outlet {
    /// Every queued line, batches flattened.
    pub fn drain(&mut self) -> Vec<ServerLine> {
        let mut lines = Vec::new();
        while let Ok(outbound) = self.rx.try_recv() {
            match outbound {
                Outbound::Line(line) => lines.push(line),
                Outbound::Batch(batch) => lines.extend(batch),
            }
        }
        lines
    }
}
