//! File-backed volume store.
//!
//! A volume file is a four-byte magic followed by the CBOR encoding of a
//! [`StoredVolume`], zstd-compressed when the magic says so.

use crate::errors::{EngineError, Result};
use crate::output::{VolumeHeader, VolumeSink, VolumeSource};
use crate::volume::{Array3, LabelVolume, RawVolume};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const MAGIC_PLAIN: &[u8; 4] = b"WSV1";
const MAGIC_ZSTD: &[u8; 4] = b"WSZ1";
const ZSTD_LEVEL: i32 = 3;

/// Element payload of a stored volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredData {
    U8(Array3<u8>),
    I8(Array3<i8>),
    U16(Array3<u16>),
    I32(Array3<i32>),
    F32(Array3<f32>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVolume {
    pub header: VolumeHeader,
    pub data: StoredData,
}

/// Reads and writes volumes as CBOR files
#[derive(Debug, Clone, Default)]
pub struct CborVolumeStore;

impl CborVolumeStore {
    pub fn new() -> Self {
        Self
    }

    /// Write `volume` to `path` (atomic write)
    pub fn write(&self, path: &Path, volume: &StoredVolume, compress: bool) -> Result<()> {
        let mut body = Vec::new();
        ciborium::into_writer(volume, &mut body)?;

        let mut bytes = Vec::with_capacity(body.len() + 4);
        if compress {
            bytes.extend_from_slice(MAGIC_ZSTD);
            bytes.extend(zstd::encode_all(body.as_slice(), ZSTD_LEVEL)?);
        } else {
            bytes.extend_from_slice(MAGIC_PLAIN);
            bytes.extend(body);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &bytes)?;
        std::fs::rename(&temp_path, path)?;

        debug!(path = %path.display(), bytes = bytes.len(), compress, "Volume written");
        Ok(())
    }

    /// Read a volume written by [`write`](Self::write)
    pub fn read(&self, path: &Path) -> Result<StoredVolume> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 4 {
            return Err(EngineError::Serialization(format!(
                "{} is not a volume file",
                path.display()
            )));
        }
        let (magic, body) = bytes.split_at(4);
        let volume = if magic == MAGIC_ZSTD {
            let raw = zstd::decode_all(body)?;
            ciborium::from_reader(raw.as_slice())?
        } else if magic == MAGIC_PLAIN {
            ciborium::from_reader(body)?
        } else {
            return Err(EngineError::Serialization(format!(
                "{} has an unknown volume header",
                path.display()
            )));
        };
        info!(path = %path.display(), "Volume loaded");
        Ok(volume)
    }
}

impl VolumeSource for CborVolumeStore {
    fn load_image(&self, path: &Path) -> Result<(RawVolume, VolumeHeader)> {
        let stored = self.read(path)?;
        let raw = match stored.data {
            StoredData::U8(a) => RawVolume::U8(a),
            StoredData::I8(a) => RawVolume::I8(a),
            StoredData::U16(a) => RawVolume::U16(a),
            StoredData::F32(a) => RawVolume::F32(a),
            StoredData::I32(a) => RawVolume::F32(a.map(|v| v as f32)),
        };
        Ok((raw, stored.header))
    }

    fn load_labels(&self, path: &Path) -> Result<LabelVolume> {
        let stored = self.read(path)?;
        Ok(match stored.data {
            StoredData::U8(a) => a.map(i32::from),
            StoredData::I8(a) => a.map(i32::from),
            StoredData::U16(a) => a.map(i32::from),
            StoredData::I32(a) => a,
            StoredData::F32(a) => a.map(|v| v.round() as i32),
        })
    }
}

impl VolumeSink for CborVolumeStore {
    fn save(&self, path: &Path, volume: &Array3<u8>, header: &VolumeHeader, compress: bool) -> Result<()> {
        let stored = StoredVolume {
            header: header.clone(),
            data: StoredData::U8(volume.clone()),
        };
        self.write(path, &stored, compress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn labels() -> Array3<u8> {
        Array3::new((0..24).map(|i| (i % 3) as u8).collect(), [2, 3, 4])
    }

    #[test]
    fn test_save_and_load_labels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("final.test.tif");
        let store = CborVolumeStore::new();

        store
            .save(&path, &labels(), &VolumeHeader::default(), false)
            .unwrap();
        let loaded = store.load_labels(&path).unwrap();
        assert_eq!(loaded, labels().map(i32::from));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_compressed_file_is_smaller() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.vol");
        let packed = dir.path().join("packed.vol");
        let store = CborVolumeStore::new();
        let big = Array3::<u8>::filled([20, 20, 20], 1);

        store.save(&plain, &big, &VolumeHeader::default(), false).unwrap();
        store.save(&packed, &big, &VolumeHeader::default(), true).unwrap();

        let plain_len = std::fs::metadata(&plain).unwrap().len();
        let packed_len = std::fs::metadata(&packed).unwrap().len();
        assert!(packed_len < plain_len);
        assert_eq!(store.load_labels(&packed).unwrap(), store.load_labels(&plain).unwrap());
    }

    #[test]
    fn test_load_image_keeps_type_and_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.vol");
        let store = CborVolumeStore::new();
        let header = VolumeHeader {
            spacing: [0.5, 1.0, 1.0],
        };
        let image = Array3::new(vec![1u16, 2, 3, 4], [1, 2, 2]);
        store
            .write(
                &path,
                &StoredVolume {
                    header: header.clone(),
                    data: StoredData::U16(image.clone()),
                },
                true,
            )
            .unwrap();

        let (raw, loaded_header) = store.load_image(&path).unwrap();
        assert_eq!(raw, RawVolume::U16(image));
        assert_eq!(loaded_header, header);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.vol");
        std::fs::write(&path, b"GIF89a....").unwrap();
        assert!(CborVolumeStore::new().read(&path).is_err());
    }
}
