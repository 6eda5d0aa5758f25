//! Collective operations over the active ranks of a job.
//!
//! A [`Group`] is ranks `0..size` of a communicator, rank 0 being the root.
//! Every gather and reduction walks the members in rank order, so the
//! result never depends on arrival order.

use super::{recv_array, recv_value, send_array, send_value, Communicator, MessageKind, Stream, Tag};
use crate::errors::{EngineError, Result};
use crate::volume::{Array3, Element};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// The active sub-communicator of a job
#[derive(Clone)]
pub struct Group {
    comm: Arc<dyn Communicator>,
    size: usize,
}

impl Group {
    /// Ranks `0..size` of `comm`
    ///
    /// # Errors
    /// Returns an error if this rank or `size` falls outside the communicator.
    pub fn new(comm: Arc<dyn Communicator>, size: usize) -> Result<Self> {
        if size == 0 || size > comm.size() {
            return Err(EngineError::Config(format!(
                "group of {} ranks in a world of {}",
                size,
                comm.size()
            )));
        }
        if comm.rank() >= size {
            return Err(EngineError::Protocol(format!(
                "rank {} is not a member of a group of {}",
                comm.rank(),
                size
            )));
        }
        Ok(Self { comm, size })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_root(&self) -> bool {
        self.comm.rank() == 0
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    fn workers(&self) -> std::ops::Range<usize> {
        1..self.size
    }

    /// Root sends `value` to every other member
    pub async fn broadcast<T: Serialize + Sync>(&self, tag: Tag, value: &T) -> Result<()> {
        for rank in self.workers() {
            send_value(self.comm(), rank, tag, value).await?;
        }
        Ok(())
    }

    /// Member receives a value from the root
    pub async fn recv_from_root<T: DeserializeOwned>(&self, tag: Tag) -> Result<T> {
        recv_value(self.comm(), 0, tag).await
    }

    /// Member sends a value to the root
    pub async fn send_to_root<T: Serialize + Sync>(&self, tag: Tag, value: &T) -> Result<()> {
        send_value(self.comm(), 0, tag, value).await
    }

    /// Root collects one value per member, its own first
    pub async fn gather<T: DeserializeOwned + Send>(&self, tag: Tag, own: T) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(self.size);
        values.push(own);
        for rank in self.workers() {
            values.push(recv_value(self.comm(), rank, tag).await?);
        }
        Ok(values)
    }

    /// Every member waits until all members have arrived
    pub async fn barrier(&self) -> Result<()> {
        let tag = Tag::new(MessageKind::Barrier);
        if self.is_root() {
            for rank in self.workers() {
                recv_value::<()>(self.comm(), rank, tag).await?;
            }
            self.broadcast(tag, &()).await?;
        } else {
            self.send_to_root(tag, &()).await?;
            self.recv_from_root::<()>(tag).await?;
        }
        debug!(rank = self.rank(), "Barrier passed");
        Ok(())
    }

    /// Element-wise sum of per-channel maps at the root.
    ///
    /// Channels travel on `stream` with the channel index as shard. The root
    /// gets `Some(sum)`; other members get `None`.
    pub async fn reduce_sum(
        &self,
        stream: Stream,
        mut channels: Vec<Array3<f32>>,
        max_elements: usize,
    ) -> Result<Option<Vec<Array3<f32>>>> {
        if !self.is_root() {
            for (k, channel) in channels.iter().enumerate() {
                send_array(self.comm(), 0, stream, k as u32, channel, max_elements).await?;
            }
            return Ok(None);
        }

        for rank in self.workers() {
            for (k, acc) in channels.iter_mut().enumerate() {
                let part: Array3<f32> = recv_array(self.comm(), rank, stream, k as u32).await?;
                acc.add_assign(&part)?;
            }
        }
        Ok(Some(channels))
    }

    /// Concatenate each member's block along Z at the root, in rank order.
    pub async fn gather_concat<T: Element>(
        &self,
        stream: Stream,
        own: Array3<T>,
        max_elements: usize,
    ) -> Result<Option<Array3<T>>> {
        if !self.is_root() {
            send_array(self.comm(), 0, stream, self.rank() as u32, &own, max_elements).await?;
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(self.size);
        parts.push(own);
        for rank in self.workers() {
            parts.push(recv_array(self.comm(), rank, stream, rank as u32).await?);
        }
        Array3::concat_z(parts).map(Some)
    }
}
