//! Intel-HEX decoding into a flat image.
//!
//! The image starts at the lowest address present; gaps between records are
//! filled with 0xFF (erased flash).

use std::collections::BTreeMap;

use super::firmware::ImageError;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXT_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

const PAD: u8 = 0xFF;

fn hex_err(line: usize, reason: impl Into<String>) -> ImageError {
    ImageError::Hex {
        line,
        reason: reason.into(),
    }
}

/// Parse an Intel-HEX document.
pub fn parse(text: &str) -> Result<Vec<u8>, ImageError> {
    let mut memory: BTreeMap<u32, u8> = BTreeMap::new();
    let mut base: u32 = 0;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let body = line
            .strip_prefix(':')
            .ok_or_else(|| hex_err(line_no, "missing ':' start code"))?;
        let bytes = hex::decode(body).map_err(|e| hex_err(line_no, e.to_string()))?;
        if bytes.len() < 5 {
            return Err(hex_err(line_no, "record too short"));
        }

        let len = bytes[0] as usize;
        if bytes.len() != len + 5 {
            return Err(hex_err(
                line_no,
                format!("length byte says {len} but record holds {}", bytes.len() - 5),
            ));
        }
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(hex_err(line_no, "checksum mismatch"));
        }

        let address = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let record_type = bytes[3];
        let data = &bytes[4..4 + len];

        match record_type {
            RECORD_DATA => {
                for (i, &b) in data.iter().enumerate() {
                    memory.insert(base.wrapping_add(address).wrapping_add(i as u32), b);
                }
            }
            RECORD_EOF => break,
            RECORD_EXT_SEGMENT | RECORD_EXT_LINEAR => {
                if len != 2 {
                    return Err(hex_err(line_no, "extended address record needs 2 bytes"));
                }
                let value = u16::from_be_bytes([data[0], data[1]]) as u32;
                base = if record_type == RECORD_EXT_SEGMENT {
                    value << 4
                } else {
                    value << 16
                };
            }
            RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
            other => return Err(hex_err(line_no, format!("unknown record type 0x{other:02X}"))),
        }
    }

    let (Some((&first, _)), Some((&last, _))) =
        (memory.first_key_value(), memory.last_key_value())
    else {
        return Ok(Vec::new());
    };

    let mut image = vec![PAD; (last - first) as usize + 1];
    for (addr, b) in memory {
        image[(addr - first) as usize] = b;
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_is_padded() {
        let text = "\
:020000001122CB
:02000400334483
:00000001FF
";
        let image = parse(text).unwrap();
        assert_eq!(image, vec![0x11, 0x22, 0xFF, 0xFF, 0x33, 0x44]);
    }

    #[test]
    fn test_extended_linear_address() {
        // base 0x0001_0000, data at 0x0001_0010
        let text = "\
:020000040001F9
:02001000ABCD76
:00000001FF
";
        assert_eq!(parse(text).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_bad_checksum() {
        let err = parse(":0400000001020304F3\n").unwrap_err();
        assert!(matches!(err, ImageError::Hex { line: 1, .. }));
    }

    #[test]
    fn test_records_after_eof_ignored() {
        let text = ":0100000042BD\n:00000001FF\n:0100010043BB\n";
        assert_eq!(parse(text).unwrap(), vec![0x42]);
    }
}
