//! Object partitioning and prefix checksums for the secure dialect.

use crc32fast::Hasher;

/// One secure-dialect object: a `[offset, offset + len)` window of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSpan {
    pub offset: usize,
    pub len: usize,
}

impl ObjectSpan {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Start of the object containing `offset`, rounded down to a `max_size` boundary.
pub fn object_start(offset: usize, max_size: usize) -> usize {
    if max_size == 0 {
        return 0;
    }
    offset / max_size * max_size
}

/// Successive objects of at most `max_size` bytes covering `[start, total)`,
/// where `start` is the resume offset rounded down to an object boundary.
#[derive(Debug, Clone)]
pub struct ObjectPartition {
    total: usize,
    max_size: usize,
    next: usize,
}

impl ObjectPartition {
    pub fn new(total: usize, max_size: usize, resume_offset: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            total,
            max_size,
            next: object_start(resume_offset.min(total), max_size),
        }
    }

    /// Objects not yet yielded.
    pub fn remaining(&self) -> usize {
        (self.total - self.next.min(self.total)).div_ceil(self.max_size)
    }
}

impl Iterator for ObjectPartition {
    type Item = ObjectSpan;

    fn next(&mut self) -> Option<ObjectSpan> {
        if self.next >= self.total {
            return None;
        }
        let span = ObjectSpan {
            offset: self.next,
            len: (self.total - self.next).min(self.max_size),
        };
        self.next = span.end();
        Some(span)
    }
}

/// CRC-32 over `data[..offset]`, computed incrementally.
///
/// Checkpoints only move forward within an object, so the hasher is kept at
/// the furthest offset seen and extended from there. A request behind the
/// cached position restarts from zero.
#[derive(Debug, Clone)]
pub struct PrefixCrc<'a> {
    data: &'a [u8],
    hasher: Hasher,
    hashed: usize,
}

impl<'a> PrefixCrc<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            hasher: Hasher::new(),
            hashed: 0,
        }
    }

    /// CRC of the first `offset` bytes. Offsets past the end are clamped.
    pub fn crc_to(&mut self, offset: usize) -> u32 {
        let offset = offset.min(self.data.len());
        if offset < self.hashed {
            self.hasher = Hasher::new();
            self.hashed = 0;
        }
        self.hasher.update(&self.data[self.hashed..offset]);
        self.hashed = offset;
        self.hasher.clone().finalize()
    }

    /// Whether `crc` matches the local checksum over `[0, offset)`.
    pub fn matches(&mut self, offset: usize, crc: u32) -> bool {
        offset <= self.data.len() && self.crc_to(offset) == crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_300_by_200() {
        let spans: Vec<_> = ObjectPartition::new(300, 200, 0).collect();
        assert_eq!(
            spans,
            vec![
                ObjectSpan { offset: 0, len: 200 },
                ObjectSpan { offset: 200, len: 100 },
            ]
        );
    }

    #[test]
    fn test_partition_covers_exactly_once() {
        for total in [1usize, 19, 20, 199, 200, 201, 300, 4096, 4097] {
            for max in [1usize, 7, 20, 200, 4096] {
                let mut resume = 0;
                while resume <= total {
                    let partition = ObjectPartition::new(total, max, resume);
                    let expected = partition.remaining();
                    let spans: Vec<_> = partition.collect();
                    assert_eq!(spans.len(), expected);

                    let mut cursor = resume;
                    for span in &spans {
                        assert_eq!(span.offset, cursor, "gap or overlap");
                        assert!(span.len > 0 && span.len <= max);
                        cursor = span.end();
                    }
                    if resume < total {
                        assert_eq!(cursor, total);
                    } else {
                        assert!(spans.is_empty());
                    }
                    resume += max;
                }
            }
        }
    }

    #[test]
    fn test_partition_rounds_resume_down() {
        let first = ObjectPartition::new(300, 200, 250).next().unwrap();
        assert_eq!(first, ObjectSpan { offset: 200, len: 100 });
        assert_eq!(object_start(199, 200), 0);
        assert_eq!(object_start(400, 200), 400);
        assert_eq!(object_start(5, 0), 0);
    }

    #[test]
    fn test_prefix_crc_matches_direct_hash() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut crc = PrefixCrc::new(&data);

        for offset in [0usize, 20, 200, 201, 999, 1000] {
            assert_eq!(crc.crc_to(offset), crc32fast::hash(&data[..offset]));
        }
        // backwards request restarts
        assert_eq!(crc.crc_to(40), crc32fast::hash(&data[..40]));
        assert!(crc.matches(100, crc32fast::hash(&data[..100])));
        assert!(!crc.matches(1001, crc32fast::hash(&data)));
    }

    #[test]
    fn test_empty_prefix_is_zero() {
        let mut crc = PrefixCrc::new(b"abc");
        assert_eq!(crc.crc_to(0), 0);
    }
}
