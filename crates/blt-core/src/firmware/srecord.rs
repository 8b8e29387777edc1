//! Motorola S-record format.
//!
//! Line layout: `S<type><count><address><data><checksum>`, all hex. `count`
//! covers address, data and checksum bytes. The checksum is the ones'
//! complement of the low byte of the sum over count, address and data.
//!
//! | Type | Meaning              | Address bytes |
//! |------|----------------------|---------------|
//! | S0   | header (ignored)     | 2             |
//! | S1   | data                 | 2             |
//! | S2   | data                 | 3             |
//! | S3   | data                 | 4             |
//! | S5   | 16-bit record count  | 2             |
//! | S6   | 24-bit record count  | 3             |
//! | S7   | start address (S3)   | 4             |
//! | S8   | start address (S2)   | 3             |
//! | S9   | start address (S1)   | 2             |

use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use super::{FirmwareError, FirmwareParser, SegmentStore};

/// Data bytes per record when saving.
pub const DEFAULT_BYTES_PER_LINE: usize = 32;

const MAX_HEADER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Header,
    Data { addr_len: usize },
    Count,
    Termination,
}

impl RecordKind {
    fn from_type(ty: u8) -> Option<(Self, usize)> {
        let kind = match ty {
            b'0' => (RecordKind::Header, 2),
            b'1' => (RecordKind::Data { addr_len: 2 }, 2),
            b'2' => (RecordKind::Data { addr_len: 3 }, 3),
            b'3' => (RecordKind::Data { addr_len: 4 }, 4),
            b'5' => (RecordKind::Count, 2),
            b'6' => (RecordKind::Count, 3),
            b'7' => (RecordKind::Termination, 4),
            b'8' => (RecordKind::Termination, 3),
            b'9' => (RecordKind::Termination, 2),
            _ => return None,
        };
        Some(kind)
    }
}

/// One decoded data record.
#[derive(Debug, PartialEq, Eq)]
struct DataRecord {
    address: u32,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SRecordParser {
    bytes_per_line: usize,
}

impl SRecordParser {
    pub fn new(bytes_per_line: usize) -> Self {
        Self {
            bytes_per_line: bytes_per_line.clamp(1, 250),
        }
    }

    /// Add all data records of `text` to `store`.
    pub fn parse_str(&self, text: &str, store: &mut SegmentStore) -> Result<(), FirmwareError> {
        let mut records = 0usize;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let parse_err = |reason: String| FirmwareError::Parse {
                line: idx + 1,
                reason,
            };
            if let Some(record) = parse_line(line).map_err(parse_err)? {
                store
                    .add_data(record.address, &record.data)
                    .map_err(|e| parse_err(e.to_string()))?;
                records += 1;
            }
        }
        debug!(records, "Parsed S-record data");
        Ok(())
    }

    /// Render `store` as S-record text.
    pub fn render(&self, store: &SegmentStore, header: &str) -> String {
        let (data_type, term_type, addr_len) = match store.address_range() {
            Some(range) if range.end > 0x0100_0000 => (b'3', b'7', 4),
            Some(range) if range.end > 0x0001_0000 => (b'2', b'8', 3),
            _ => (b'1', b'9', 2),
        };

        let mut out = String::new();
        let header = header.as_bytes();
        push_record(&mut out, b'0', 2, 0, &header[..header.len().min(MAX_HEADER_LEN)]);
        for seg in store.segments() {
            for (n, chunk) in seg.data().chunks(self.bytes_per_line).enumerate() {
                let address = seg.base().wrapping_add((n * self.bytes_per_line) as u32);
                push_record(&mut out, data_type, addr_len, address, chunk);
            }
        }
        push_record(&mut out, term_type, addr_len, 0, &[]);
        out
    }
}

impl Default for SRecordParser {
    fn default() -> Self {
        Self::new(DEFAULT_BYTES_PER_LINE)
    }
}

impl FirmwareParser for SRecordParser {
    fn load(&self, path: &Path, store: &mut SegmentStore) -> Result<(), FirmwareError> {
        let text = fs::read_to_string(path)?;
        self.parse_str(&text, store)
    }

    fn save(&self, path: &Path, store: &SegmentStore) -> Result<(), FirmwareError> {
        let header = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("firmware");
        let text = self.render(store, header);
        let mut writer = BufWriter::new(fs::File::create(path)?);
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// Decode one line. Returns `None` for non-data records.
fn parse_line(line: &str) -> Result<Option<DataRecord>, String> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || bytes[0] != b'S' {
        return Err("line does not start with an S-record marker".into());
    }
    let (kind, addr_len) =
        RecordKind::from_type(bytes[1]).ok_or_else(|| format!("unknown record type S{}", bytes[1] as char))?;

    let payload = decode_hex(&line[2..])?;
    let count = payload[0] as usize;
    if payload.len() != count + 1 {
        return Err(format!(
            "byte count {count} does not match {} bytes on the line",
            payload.len() - 1
        ));
    }
    if count < addr_len + 1 {
        return Err(format!("byte count {count} too small for the address field"));
    }

    let (body, checksum) = payload.split_at(payload.len() - 1);
    let expected = record_checksum(body);
    if checksum[0] != expected {
        return Err(format!(
            "checksum mismatch: expected 0x{expected:02X}, found 0x{:02X}",
            checksum[0]
        ));
    }

    match kind {
        RecordKind::Data { addr_len } => {
            let address = body[1..=addr_len]
                .iter()
                .fold(0u32, |acc, &b| (acc << 8) | b as u32);
            let data = body[1 + addr_len..].to_vec();
            if data.is_empty() {
                return Ok(None);
            }
            Ok(Some(DataRecord { address, data }))
        }
        RecordKind::Header | RecordKind::Count | RecordKind::Termination => Ok(None),
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    if text.len() % 2 != 0 || text.is_empty() {
        return Err("odd number of hex digits".into());
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex digits at column {}", i + 3))
        })
        .collect()
}

fn record_checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn push_record(out: &mut String, ty: u8, addr_len: usize, address: u32, data: &[u8]) {
    let mut body = Vec::with_capacity(1 + addr_len + data.len());
    body.push((addr_len + data.len() + 1) as u8);
    body.extend_from_slice(&address.to_be_bytes()[4 - addr_len..]);
    body.extend_from_slice(data);
    let checksum = record_checksum(&body);

    out.push('S');
    out.push(ty as char);
    for b in body.iter().chain(std::iter::once(&checksum)) {
        let _ = write!(out, "{b:02X}");
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_s19() {
        // Classic Wikipedia example, S1 records with an S9 terminator.
        let text = "\
S00F000068656C6C6F202020202000003C
S11F00007C0802A6900100049421FFF07C6C1B787C8C23783C6000003863000026
S11F001C4BFFFFE5398000007D83637880010014382100107C0803A64E800020E9
S111003848656C6C6F20776F726C642E0A0042
S5030003F9
S9030000FC
";
        let mut store = SegmentStore::new();
        SRecordParser::default().parse_str(text, &mut store).unwrap();

        assert_eq!(store.segment_count(), 1);
        let seg = store.segment(0).unwrap();
        assert_eq!(seg.base(), 0x0000);
        assert_eq!(seg.len(), 28 + 28 + 14);
        assert_eq!(&seg.data()[..4], &[0x7C, 0x08, 0x02, 0xA6]);
        assert_eq!(&seg.data()[56..], b"Hello world.\n\0");
    }

    #[test]
    fn test_parse_s3_gaps() {
        let mut store = SegmentStore::new();
        let mut text = String::new();
        push_record(&mut text, b'3', 4, 0x0800_0000, &[1, 2, 3, 4]);
        push_record(&mut text, b'3', 4, 0x0800_1000, &[5, 6]);
        push_record(&mut text, b'7', 4, 0x0800_0000, &[]);

        SRecordParser::default().parse_str(&text, &mut store).unwrap();
        assert_eq!(store.segment_count(), 2);
        assert_eq!(store.segment(1).unwrap().base(), 0x0800_1000);
    }

    #[test]
    fn test_checksum_error_reports_line() {
        let text = "S00600004844521B\nS1070000010203FF00\n";
        let err = SRecordParser::default()
            .parse_str(text, &mut SegmentStore::new())
            .unwrap_err();
        match err {
            FirmwareError::Parse { line, reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("checksum"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_malformed_lines() {
        for bad in ["X1030000FC", "S4030000FC", "S10300", "S1030000F", "S105000001F9"] {
            let result = SRecordParser::default().parse_str(bad, &mut SegmentStore::new());
            assert!(
                matches!(result, Err(FirmwareError::Parse { line: 1, .. })),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_render_picks_record_width() {
        let mut store = SegmentStore::new();
        store.add_data(0x00FF_0000, &[0xAA; 40]).unwrap();
        let text = SRecordParser::default().render(&store, "fw");
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].starts_with("S0"));
        assert!(lines[1].starts_with("S2"));
        assert_eq!(lines.len(), 1 + 2 + 1);
        assert!(lines[3].starts_with("S8"));

        let mut reparsed = SegmentStore::new();
        SRecordParser::default().parse_str(&text, &mut reparsed).unwrap();
        assert_eq!(reparsed.segment(0).unwrap().data(), &[0xAA; 40]);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = std::env::temp_dir().join(format!("blt-srec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image.srec");

        let mut store = SegmentStore::new();
        store.add_data(0x2000_0000, b"vector table").unwrap();
        store.add_data(0x2000_0100, &[0x55; 100]).unwrap();

        let parser = SRecordParser::default();
        parser.save(&path, &store).unwrap();
        let mut loaded = SegmentStore::new();
        parser.load(&path, &mut loaded).unwrap();

        assert_eq!(loaded.segment_count(), 2);
        assert_eq!(loaded.segment(0).unwrap().data(), b"vector table");
        assert_eq!(loaded.segment(1).unwrap().len(), 100);

        // Header carries the stem, not the extension.
        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(&header[8..header.len() - 2], "696D616765");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
