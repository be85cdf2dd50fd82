//! Firmware image and init packet sources.
//!
//! Handles:
//! - Raw binary (`.bin`) and Intel-HEX (`.hex`) firmware images
//! - Init packets (`.dat`), sent verbatim
//! - Fixed-size segment iteration for data writes

use std::path::Path;

use thiserror::Error;
use tracing::info;

use super::ihex;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("{path} is empty")]
    Empty { path: String },
    #[error("Unsupported image format: '{0}' (expected .bin or .hex)")]
    UnsupportedFormat(String),
    #[error("Intel-HEX line {line}: {reason}")]
    Hex { line: usize, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat firmware image, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Load a firmware image, choosing the decoder by file extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let data = match ext.as_str() {
            "bin" => std::fs::read(path)?,
            "hex" | "ihex" => ihex::parse(&std::fs::read_to_string(path)?)?,
            other => return Err(ImageError::UnsupportedFormat(other.to_string())),
        };
        if data.is_empty() {
            return Err(ImageError::Empty {
                path: path.display().to_string(),
            });
        }

        let image = Self::new(data);
        info!(
            path = %path.display(),
            size = image.len(),
            crc32 = %format!("0x{:08X}", image.crc32()),
            "Loaded firmware image"
        );
        Ok(image)
    }

    /// Decode an Intel-HEX document.
    pub fn from_intel_hex(text: &str) -> Result<Self, ImageError> {
        ihex::parse(text).map(Self::new)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// CRC-32 (ISO-3309) of the whole image.
    pub fn crc32(&self) -> u32 {
        crc32fast::hash(&self.data)
    }
}

/// Init packet (`.dat`): metadata the bootloader validates before it
/// accepts any firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitData {
    data: Vec<u8>,
}

impl InitData {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        if data.is_empty() {
            return Err(ImageError::Empty {
                path: path.display().to_string(),
            });
        }
        info!(path = %path.display(), size = data.len(), "Loaded init packet");
        Ok(Self::new(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator over fixed-size segments with a short final segment.
#[derive(Debug)]
pub struct SegmentIter<'a> {
    data: &'a [u8],
    segment_size: usize,
    offset: usize,
}

impl<'a> SegmentIter<'a> {
    pub fn new(data: &'a [u8], segment_size: usize) -> Self {
        Self {
            data,
            segment_size: segment_size.max(1),
            offset: 0,
        }
    }

    /// Number of segments, including a partial last one.
    pub fn total(&self) -> usize {
        self.data.len().div_ceil(self.segment_size)
    }
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let len = (self.data.len() - self.offset).min(self.segment_size);
        let segment = &self.data[self.offset..self.offset + len];
        self.offset += len;

        Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_segments_with_residual() {
        let data = [7u8; 23];
        let iter = SegmentIter::new(&data, 20);
        assert_eq!(iter.total(), 2);

        let segments: Vec<_> = SegmentIter::new(&data, 20).collect();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 20);
        assert_eq!(segments[1].len(), 3);
    }

    #[test]
    fn test_segments_aligned() {
        let data = [1u8; 40];
        assert_eq!(SegmentIter::new(&data, 20).total(), 2);
        assert_eq!(SegmentIter::new(&[], 20).total(), 0);
        assert_eq!(SegmentIter::new(&[], 20).next(), None);
    }

    #[test]
    fn test_load_bin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, [0xAA, 0xBB, 0xCC]).unwrap();

        let image = FirmwareImage::load(&path).unwrap();
        assert_eq!(image.as_bytes(), &[0xAA, 0xBB, 0xCC]);
        assert_eq!(image.crc32(), crc32fast::hash(&[0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn test_load_hex() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.hex");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, ":0400000001020304F2").unwrap();
        writeln!(f, ":00000001FF").unwrap();

        let image = FirmwareImage::load(&path).unwrap();
        assert_eq!(image.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_load_rejects_empty_and_unknown() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, []).unwrap();
        assert!(matches!(
            FirmwareImage::load(&empty),
            Err(ImageError::Empty { .. })
        ));

        let elf = dir.path().join("app.elf");
        std::fs::write(&elf, [1]).unwrap();
        assert!(matches!(
            FirmwareImage::load(&elf),
            Err(ImageError::UnsupportedFormat(ext)) if ext == "elf"
        ));

        let dat = dir.path().join("app.dat");
        std::fs::write(&dat, []).unwrap();
        assert!(matches!(InitData::load(&dat), Err(ImageError::Empty { .. })));
    }
}
