//! Message passing between ranks.
//!
//! Rank 0 is the coordinator. Every rank owns a [`Communicator`] that sends
//! tagged [`Envelope`]s and receives them by `(source, tag)`, buffering
//! anything that arrives early.

pub mod array;
pub mod codec;
pub mod collective;
pub mod envelope;
pub mod local;
pub mod tcp;

pub use array::{check_chunkable, reassemble, recv_array, send_array, split, ArrayHeader};
pub use codec::{read_frame, write_frame, MAX_CHUNK_ELEMENTS, MAX_FRAME_BYTES};
pub use collective::Group;
pub use envelope::{Envelope, MessageKind, Stream, Tag};
pub use local::LocalCluster;
pub use tcp::TcpCommunicator;

use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// Point-to-point messaging for one rank
#[async_trait]
pub trait Communicator: Send + Sync {
    /// This rank's index
    fn rank(&self) -> usize;

    /// Number of ranks, coordinator included
    fn size(&self) -> usize;

    /// Deliver an envelope to `dest`
    async fn send(&self, dest: usize, envelope: Envelope) -> Result<()>;

    /// Wait for the envelope from `source` carrying `tag`
    async fn recv(&self, source: usize, tag: Tag) -> Result<Envelope>;
}

/// Incoming envelopes for one rank plus those received ahead of their turn
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

struct MailboxInner {
    rx: mpsc::UnboundedReceiver<Result<Envelope>>,
    pending: Vec<Envelope>,
}

impl Mailbox {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<Envelope>>) -> Self {
        Self {
            inner: Mutex::new(MailboxInner {
                rx,
                pending: Vec::new(),
            }),
        }
    }

    /// Take the first envelope matching `(source, tag)`
    pub async fn take(&self, rank: usize, source: usize, tag: Tag) -> Result<Envelope> {
        let mut inner = self.inner.lock().await;

        if let Some(pos) = inner.pending.iter().position(|e| e.matches(source, &tag)) {
            return Ok(inner.pending.remove(pos));
        }

        loop {
            let envelope = inner.rx.recv().await.ok_or_else(|| {
                EngineError::Transport(format!(
                    "rank {} mailbox closed while waiting for {:?} from {}",
                    rank, tag, source
                ))
            })??;

            if envelope.matches(source, &tag) {
                return Ok(envelope);
            }
            trace!(rank, from = envelope.source, tag = ?envelope.tag, "Buffering early message");
            inner.pending.push(envelope);
        }
    }

    /// Number of envelopes received but not yet taken
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

/// Send a serializable value
pub async fn send_value<T: serde::Serialize + Sync>(
    comm: &dyn Communicator,
    dest: usize,
    tag: Tag,
    value: &T,
) -> Result<()> {
    let envelope = Envelope::encode(comm.rank(), tag, value)?;
    comm.send(dest, envelope).await
}

/// Receive and decode a value
pub async fn recv_value<T: serde::de::DeserializeOwned>(
    comm: &dyn Communicator,
    source: usize,
    tag: Tag,
) -> Result<T> {
    comm.recv(source, tag).await?.decode()
}
