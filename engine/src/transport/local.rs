//! In-process cluster: one mailbox per rank, connected by channels.
//!
//! Envelopes are pushed through the same frame encoder as the TCP transport
//! so the frame size limit applies identically.

use super::codec::{decode_frame, encode_frame};
use super::{Communicator, Envelope, Mailbox, Tag};
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Factory for a fully connected set of in-process communicators
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` communicators, index = rank
    pub fn new(size: usize) -> Vec<Arc<LocalCommunicator>> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| {
                Arc::new(LocalCommunicator {
                    rank,
                    peers: senders.clone(),
                    mailbox: Mailbox::new(rx),
                })
            })
            .collect()
    }
}

pub struct LocalCommunicator {
    rank: usize,
    peers: Vec<mpsc::UnboundedSender<Result<Envelope>>>,
    mailbox: Mailbox,
}

impl LocalCommunicator {
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    async fn send(&self, dest: usize, envelope: Envelope) -> Result<()> {
        let peer = self.peers.get(dest).ok_or_else(|| {
            EngineError::Transport(format!("rank {} does not exist", dest))
        })?;

        let frame = encode_frame(&envelope)
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let decoded = decode_frame(&frame).map_err(|e| EngineError::Transport(e.to_string()));

        peer.send(decoded)
            .map_err(|_| EngineError::Transport(format!("rank {} is gone", dest)))
    }

    async fn recv(&self, source: usize, tag: Tag) -> Result<Envelope> {
        self.mailbox.take(self.rank, source, tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{recv_value, send_value, MessageKind};

    #[tokio::test]
    async fn test_point_to_point() {
        let comms = LocalCluster::new(2);
        assert_eq!(comms[0].size(), 2);
        assert_eq!(comms[1].rank(), 1);

        let tag = Tag::new(MessageKind::WorkerCount);
        send_value(comms[0].as_ref(), 1, tag, &7usize).await.unwrap();
        let v: usize = recv_value(comms[1].as_ref(), 0, tag).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_out_of_order_messages_are_buffered() {
        let comms = LocalCluster::new(2);
        let first = Tag::new(MessageKind::Executable);
        let second = Tag::new(MessageKind::Mode);

        send_value(comms[0].as_ref(), 1, second, &"later").await.unwrap();
        send_value(comms[0].as_ref(), 1, first, &true).await.unwrap();

        let ok: bool = recv_value(comms[1].as_ref(), 0, first).await.unwrap();
        assert!(ok);
        assert_eq!(comms[1].mailbox().pending().await, 1);

        let s: String = recv_value(comms[1].as_ref(), 0, second).await.unwrap();
        assert_eq!(s, "later");
        assert_eq!(comms[1].mailbox().pending().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_missing_rank() {
        let comms = LocalCluster::new(1);
        let err = send_value(comms[0].as_ref(), 3, Tag::new(MessageKind::Proceed), &true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
