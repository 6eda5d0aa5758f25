//! Multi-process transport over TCP.
//!
//! Star topology: the coordinator (rank 0) listens, each worker connects
//! once and introduces itself with a `Hello` frame carrying its rank. All
//! collectives route through rank 0, so workers only ever talk to it.

use super::codec::{read_frame, write_frame};
use super::{Communicator, Envelope, Mailbox, MessageKind, Tag};
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub struct TcpCommunicator {
    rank: usize,
    size: usize,
    writers: HashMap<usize, Mutex<OwnedWriteHalf>>,
    mailbox: Mailbox,
}

impl TcpCommunicator {
    /// Accept `size - 1` workers on `listen_addr`
    pub async fn coordinator(listen_addr: &str, size: usize) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(addr = %listener.local_addr()?, size, "Coordinator listening");
        Self::accept_workers(listener, size).await
    }

    /// Accept workers on an already bound listener
    pub async fn accept_workers(listener: TcpListener, size: usize) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writers = HashMap::new();

        while writers.len() + 1 < size {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let (mut reader, writer) = stream.into_split();

            let hello = read_frame(&mut reader).await?;
            if hello.tag.kind != MessageKind::Hello {
                warn!(%peer, tag = ?hello.tag, "Connection did not start with hello");
                continue;
            }
            let rank: usize = hello.decode()?;
            if rank == 0 || rank >= size || writers.contains_key(&rank) {
                return Err(EngineError::Protocol(format!(
                    "worker at {} claimed invalid rank {}",
                    peer, rank
                )));
            }

            info!(%peer, rank, "Worker connected");
            writers.insert(rank, Mutex::new(writer));
            spawn_reader(rank, reader, tx.clone());
        }

        Ok(Self {
            rank: 0,
            size,
            writers,
            mailbox: Mailbox::new(rx),
        })
    }

    /// Connect to the coordinator as `rank`, retrying until `timeout`
    pub async fn worker(
        coordinator_addr: &str,
        rank: usize,
        size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if rank == 0 || rank >= size {
            return Err(EngineError::Config(format!(
                "worker rank {} outside 1..{}",
                rank, size
            )));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(coordinator_addr).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    debug!(addr = coordinator_addr, error = %e, "Coordinator not reachable yet");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => {
                    return Err(EngineError::Transport(format!(
                        "could not reach coordinator at {}: {}",
                        coordinator_addr, e
                    )))
                }
            }
        };
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();

        let hello = Envelope::encode(rank, Tag::new(MessageKind::Hello), &rank)?;
        write_frame(&mut writer, &hello).await?;
        info!(addr = coordinator_addr, rank, "Connected to coordinator");

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_reader(0, reader, tx);

        let mut writers = HashMap::new();
        writers.insert(0, Mutex::new(writer));

        Ok(Self {
            rank,
            size,
            writers,
            mailbox: Mailbox::new(rx),
        })
    }
}

/// Forward frames from one peer into the mailbox until the socket closes.
fn spawn_reader(
    peer: usize,
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Result<Envelope>>,
) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(mut envelope) => {
                    // the socket identifies the sender
                    envelope.source = peer as u32;
                    if tx.send(Ok(envelope)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(peer, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(peer, error = %e, "Failed to read frame");
                    let _ = tx.send(Err(EngineError::Transport(format!(
                        "rank {}: {}",
                        peer, e
                    ))));
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&self, dest: usize, envelope: Envelope) -> Result<()> {
        let writer = self.writers.get(&dest).ok_or_else(|| {
            EngineError::Transport(format!(
                "rank {} has no connection to rank {}",
                self.rank, dest
            ))
        })?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &envelope)
            .await
            .map_err(|e| EngineError::Transport(format!("send to rank {}: {}", dest, e)))
    }

    async fn recv(&self, source: usize, tag: Tag) -> Result<Envelope> {
        self.mailbox.take(self.rank, source, tag).await
    }
}
