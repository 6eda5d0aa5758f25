//! Array Transport: moves 3-D arrays of any size over a channel whose
//! messages are capped at `max_elements` elements.
//!
//! The sender first transmits an [`ArrayHeader`] so the receiver can
//! preallocate, then the array in contiguous C-order pieces. Pieces are
//! whole Z-slabs when a plane fits under the ceiling, otherwise runs of
//! rows within one plane.

use super::{recv_value, send_value, Communicator, MessageKind, Stream, Tag};
use crate::errors::{EngineError, Result};
use crate::volume::{Array3, Element, ElementType};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Sent ahead of the chunks of one array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayHeader {
    pub shape: [usize; 3],
    pub element: ElementType,
    pub parts: u32,
}

/// Whether an array of `shape` can be split under `max_elements`, without
/// touching its data.
pub fn check_chunkable(shape: [usize; 3], max_elements: usize) -> Result<()> {
    let max_elements = max_elements.max(1);
    let [dz, dy, dx] = shape;
    let plane = dy * dx;
    if dz * plane > max_elements && plane > max_elements && dx > max_elements {
        return Err(EngineError::Transport(format!(
            "row of {} elements exceeds chunk ceiling {}",
            dx, max_elements
        )));
    }
    Ok(())
}

/// Split `array` into contiguous C-order pieces of at most `max_elements`.
///
/// # Errors
/// Returns an error if a single row is longer than the ceiling.
pub fn split<T: Element>(array: &Array3<T>, max_elements: usize) -> Result<Vec<Array3<T>>> {
    check_chunkable(array.shape(), max_elements)?;
    let max_elements = max_elements.max(1);
    let [dz, dy, dx] = array.shape();
    let plane = dy * dx;

    if array.len() <= max_elements || plane == 0 {
        return Ok(vec![array.clone()]);
    }

    if plane <= max_elements {
        let step = max_elements / plane;
        return (0..dz)
            .step_by(step)
            .map(|z0| array.slab(z0, (z0 + step).min(dz)))
            .collect();
    }

    let rows = max_elements / dx;
    let mut pieces = Vec::with_capacity(dz * dy.div_ceil(rows));
    for z in 0..dz {
        for y0 in (0..dy).step_by(rows) {
            pieces.push(array.crop([z, y0, 0], [z + 1, (y0 + rows).min(dy), dx])?);
        }
    }
    Ok(pieces)
}

/// Rebuild the array described by `header` from its pieces, in order.
pub fn reassemble<T: Element>(header: &ArrayHeader, pieces: Vec<Array3<T>>) -> Result<Array3<T>> {
    if header.element != T::TYPE {
        return Err(EngineError::Protocol(format!(
            "expected {:?} array, header announces {:?}",
            T::TYPE,
            header.element
        )));
    }
    if pieces.len() != header.parts as usize {
        return Err(EngineError::Protocol(format!(
            "expected {} pieces, got {}",
            header.parts,
            pieces.len()
        )));
    }
    let total: usize = header.shape.iter().product();
    let mut data = Vec::with_capacity(total);
    for piece in pieces {
        data.extend(piece.into_vec());
    }
    Array3::from_vec(data, header.shape)
}

/// Send `array` to `dest` on `(stream, shard)`
pub async fn send_array<T: Element>(
    comm: &dyn Communicator,
    dest: usize,
    stream: Stream,
    shard: u32,
    array: &Array3<T>,
    max_elements: usize,
) -> Result<()> {
    let pieces = split(array, max_elements)?;
    let header = ArrayHeader {
        shape: array.shape(),
        element: T::TYPE,
        parts: pieces.len() as u32,
    };
    trace!(dest, ?stream, shard, parts = header.parts, "Sending array");

    send_value(
        comm,
        dest,
        Tag::new(MessageKind::ArrayHeader(stream)).with_shard(shard),
        &header,
    )
    .await?;

    for (part, piece) in pieces.iter().enumerate() {
        let tag = Tag::new(MessageKind::ArrayChunk(stream))
            .with_shard(shard)
            .with_part(part as u32);
        send_value(comm, dest, tag, piece).await?;
    }
    Ok(())
}

/// Receive an array sent with [`send_array`]
pub async fn recv_array<T: Element>(
    comm: &dyn Communicator,
    source: usize,
    stream: Stream,
    shard: u32,
) -> Result<Array3<T>> {
    let header: ArrayHeader = recv_value(
        comm,
        source,
        Tag::new(MessageKind::ArrayHeader(stream)).with_shard(shard),
    )
    .await?;

    if header.element != T::TYPE {
        return Err(EngineError::Protocol(format!(
            "expected {:?} array on {:?}, header announces {:?}",
            T::TYPE,
            stream,
            header.element
        )));
    }

    let mut pieces = Vec::with_capacity(header.parts as usize);
    for part in 0..header.parts {
        let tag = Tag::new(MessageKind::ArrayChunk(stream))
            .with_shard(shard)
            .with_part(part);
        pieces.push(recv_value::<Array3<T>>(comm, source, tag).await?);
    }
    reassemble(&header, pieces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalCluster;

    fn ramp(shape: [usize; 3]) -> Array3<f32> {
        let len: usize = shape.iter().product();
        Array3::new((0..len).map(|i| i as f32 * 0.5).collect(), shape)
    }

    fn header_for<T: Element>(a: &Array3<T>, parts: usize) -> ArrayHeader {
        ArrayHeader {
            shape: a.shape(),
            element: T::TYPE,
            parts: parts as u32,
        }
    }

    #[test]
    fn test_small_array_is_one_piece() {
        let a = ramp([2, 3, 4]);
        let pieces = split(&a, 1000).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(reassemble(&header_for(&a, 1), pieces).unwrap(), a);
    }

    #[test]
    fn test_split_by_slabs() {
        let a = ramp([7, 3, 4]);
        // 12 elements per plane, two planes per piece
        let pieces = split(&a, 25).unwrap();
        assert_eq!(pieces.len(), 4);
        assert!(pieces.iter().all(|p| p.len() <= 25));
        assert_eq!(pieces[3].shape(), [1, 3, 4]);
        let n = pieces.len();
        assert_eq!(reassemble(&header_for(&a, n), pieces).unwrap(), a);
    }

    #[test]
    fn test_split_by_rows_when_plane_exceeds_ceiling() {
        let a = ramp([2, 5, 4]);
        let pieces = split(&a, 9).unwrap();
        // two rows per piece, three pieces per plane
        assert_eq!(pieces.len(), 6);
        assert!(pieces.iter().all(|p| p.len() <= 9));
        let n = pieces.len();
        assert_eq!(reassemble(&header_for(&a, n), pieces).unwrap(), a);
    }

    #[test]
    fn test_row_longer_than_ceiling_fails() {
        let a = ramp([1, 1, 10]);
        assert!(split(&a, 4).is_err());
    }

    #[test]
    fn test_check_chunkable_agrees_with_split() {
        assert!(check_chunkable([1, 1, 10], 4).is_err());
        assert!(check_chunkable([3, 10, 10], 4).is_err());
        // short volume fits whole even though its rows are long
        assert!(check_chunkable([1, 1, 10], 10).is_ok());
        assert!(check_chunkable([2, 5, 4], 9).is_ok());
        assert!(check_chunkable([9, 6, 5], 40).is_ok());
    }

    #[test]
    fn test_reassemble_rejects_wrong_element() {
        let a = ramp([1, 2, 2]);
        let header = ArrayHeader {
            shape: a.shape(),
            element: ElementType::U8,
            parts: 1,
        };
        assert!(reassemble(&header, vec![a]).is_err());
    }

    #[tokio::test]
    async fn test_send_recv_above_ceiling() {
        let comms = LocalCluster::new(2);
        let a = ramp([9, 6, 5]);
        send_array(comms[1].as_ref(), 0, Stream::Response, 2, &a, 40)
            .await
            .unwrap();
        let b: Array3<f32> = recv_array(comms[0].as_ref(), 1, Stream::Response, 2)
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_streams_do_not_mix() {
        let comms = LocalCluster::new(2);
        let seg = Array3::<u8>::filled([3, 2, 2], 1);
        let unc = Array3::<u8>::filled([3, 2, 2], 200);
        send_array(comms[1].as_ref(), 0, Stream::Segmentation, 0, &seg, 4)
            .await
            .unwrap();
        send_array(comms[1].as_ref(), 0, Stream::Uncertainty, 0, &unc, 4)
            .await
            .unwrap();

        let got_unc: Array3<u8> = recv_array(comms[0].as_ref(), 1, Stream::Uncertainty, 0)
            .await
            .unwrap();
        let got_seg: Array3<u8> = recv_array(comms[0].as_ref(), 1, Stream::Segmentation, 0)
            .await
            .unwrap();
        assert_eq!(got_seg, seg);
        assert_eq!(got_unc, unc);
    }

    #[tokio::test]
    async fn test_recv_rejects_type_mismatch() {
        let comms = LocalCluster::new(2);
        let seg = Array3::<u8>::filled([1, 2, 2], 1);
        send_array(comms[1].as_ref(), 0, Stream::Segmentation, 0, &seg, 100)
            .await
            .unwrap();
        let result = recv_array::<f32>(comms[0].as_ref(), 1, Stream::Segmentation, 0).await;
        assert!(result.is_err());
    }
}
