use crate::errors::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Array streams exchanged between ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Image,
    Labels,
    /// Per-label response map; the tag's `shard` carries the channel index
    Response,
    Segmentation,
    Uncertainty,
    Smoothed,
}

/// What a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Worker introduction on a fresh connection
    Hello,
    Executable,
    Mode,
    WorkerCount,
    WorkerJob,
    BindStatus,
    Proceed,
    ShardSpec,
    ArrayHeader(Stream),
    ArrayChunk(Stream),
    ResultStatus,
    Collect,
    Barrier,
}

/// Message tag: `(kind, shard, part)`.
///
/// `shard` names a stream instance (a label channel, a worker's block) and
/// `part` the chunk index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub kind: MessageKind,
    pub shard: u32,
    pub part: u32,
}

impl Tag {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            shard: 0,
            part: 0,
        }
    }

    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = shard;
        self
    }

    pub fn with_part(mut self, part: u32) -> Self {
        self.part = part;
        self
    }
}

/// A tagged message with a CBOR payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: u32,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encode `value` as the payload
    pub fn encode<T: Serialize>(source: usize, tag: Tag, value: &T) -> Result<Self> {
        let mut payload = Vec::new();
        ciborium::into_writer(value, &mut payload)?;
        Ok(Self {
            source: source as u32,
            tag,
            payload,
        })
    }

    /// Decode the payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(ciborium::from_reader(self.payload.as_slice())?)
    }

    /// Serialize the whole envelope to CBOR bytes
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        Ok(ciborium::from_reader(bytes)?)
    }

    /// Whether this envelope answers a `recv(source, tag)`
    pub fn matches(&self, source: usize, tag: &Tag) -> bool {
        self.source as usize == source && &self.tag == tag
    }
}
