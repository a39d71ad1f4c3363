use std::collections::HashMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};

use crate::bytestream::{interpret_bytes_as_utf16, ByteStream};
use crate::mft::{file_attribute_tokens, join_tokens};
use crate::timeline::{MacbMask, PathIndexEntry, TimelineEvent};

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// Window size for skipping the zero run at the front of a dumped journal.
const SCAN_WINDOW: usize = 64 * 1024;

/// Fixed part of a USN_RECORD_V2, including the leading record length.
const USN_V2_HEADER_LEN: u32 = 60;

/// USN change reasons, in canonical mask order.
pub const USN_REASON_TOKENS: &[(u32, &str)] = &[
    (0x0000_0001, "DATA_OVERWRITE"),
    (0x0000_0002, "DATA_EXTEND"),
    (0x0000_0004, "DATA_TRUNCATION"),
    (0x0000_0010, "NAMED_DATA_OVERWRITE"),
    (0x0000_0020, "NAMED_DATA_EXTEND"),
    (0x0000_0040, "NAMED_DATA_TRUNCATION"),
    (0x0000_0100, "FILE_CREATE"),
    (0x0000_0200, "FILE_DELETE"),
    (0x0000_0400, "EA_CHANGE"),
    (0x0000_0800, "SECURITY_CHANGE"),
    (0x0000_1000, "RENAME_OLD_NAME"),
    (0x0000_2000, "RENAME_NEW_NAME"),
    (0x0000_4000, "INDEXABLE_CHANGE"),
    (0x0000_8000, "BASIC_INFO_CHANGE"),
    (0x0001_0000, "HARD_LINK_CHANGE"),
    (0x0002_0000, "COMPRESSION_CHANGE"),
    (0x0004_0000, "ENCRYPTION_CHANGE"),
    (0x0008_0000, "OBJECT_ID_CHANGE"),
    (0x0010_0000, "REPARSE_POINT_CHANGE"),
    (0x0020_0000, "STREAM_CHANGE"),
    (0x0040_0000, "TRANSACTED_CHANGE"),
    (0x0080_0000, "INTEGRITY_CHANGE"),
    (0x8000_0000, "CLOSE"),
];

pub fn reason_tokens(mask: u32) -> String {
    join_tokens(USN_REASON_TOKENS, mask)
}

/// Converts a Windows FILETIME (100 ns ticks since 1601-01-01) to UTC.
pub fn filetime_to_utc(ticks: i64) -> DateTime<Utc> {
    let seconds = ticks.div_euclid(10_000_000) - FILETIME_UNIX_OFFSET_SECS;
    let nanos = (ticks.rem_euclid(10_000_000) * 100) as u32;
    Utc.timestamp_opt(seconds, nanos)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A parsed USN_RECORD_V2.
#[derive(Debug, Clone)]
pub struct UsnRecordV2 {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_ref: u64,
    pub parent_file_ref: u64,
    pub usn: i64,
    pub timestamp: i64,
    pub reason: u32,
    pub source_info: u32,
    pub security_id: u32,
    pub file_attributes: u32,
    pub filename: String,
}

impl UsnRecordV2 {
    /// Low 6 bytes of a file reference are the MFT entry number.
    pub fn entry_number(&self) -> u64 {
        self.file_ref & 0x0000_FFFF_FFFF_FFFF
    }

    /// Top 2 bytes are the sequence number.
    pub fn seq_number(&self) -> i16 {
        (self.file_ref >> 48) as i16
    }

    pub fn parent_entry_number(&self) -> u64 {
        self.parent_file_ref & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        filetime_to_utc(self.timestamp)
    }
}

/// Walks USN v2 records out of a journal payload. Dumped `$J` streams are
/// mostly leading zero fill, and live records are 8-aligned with null
/// padding between them.
pub struct UsnJournalParser {
    stream: ByteStream,
    size: u64,
}

impl UsnJournalParser {
    pub fn open(path: &Path) -> io::Result<Self> {
        let stream = ByteStream::open(path)?;
        let size = stream.size();
        Ok(Self { stream, size })
    }

    /// Absolute offset of the first non-zero byte, scanning forward in
    /// 64 KiB windows.
    fn find_first_record(&mut self) -> io::Result<Option<u64>> {
        self.stream.seek_to(0)?;
        let mut window = vec![0u8; SCAN_WINDOW];
        let mut offset = 0u64;
        loop {
            let read = self.stream.read_available(&mut window)?;
            if read == 0 {
                return Ok(None);
            }
            if let Some(index) = window[..read].iter().position(|byte| *byte != 0) {
                return Ok(Some(offset + index as u64));
            }
            offset += read as u64;
        }
    }

    /// Skips 4-byte null padding words until a record length turns up,
    /// leaves the stream aligned on the record header and returns the
    /// offset just past the record. `None` means end of journal or a
    /// length that cannot be right.
    fn find_next_record(&mut self) -> io::Result<Option<u64>> {
        loop {
            if self.stream.position()? >= self.size {
                return Ok(None);
            }
            let record_length = match self.stream.read_u32() {
                Ok(value) => value,
                Err(_) => return Ok(None),
            };
            if record_length == 0 {
                continue;
            }
            let start = self.stream.rewind_by(4)?;
            let next = start + u64::from(record_length);
            if record_length < USN_V2_HEADER_LEN || next > self.size {
                return Ok(None);
            }
            return Ok(Some(next));
        }
    }

    /// Reads the record the stream is positioned on. The filename is
    /// decoded as UTF-16LE; decode failure yields an empty string.
    fn read_record(&mut self) -> io::Result<UsnRecordV2> {
        let start = self.stream.position()?;
        let _record_length = self.stream.read_u32()?;
        let major_version = self.stream.read_u16()?;
        let minor_version = self.stream.read_u16()?;
        let file_ref = self.stream.read_u64()?;
        let parent_file_ref = self.stream.read_u64()?;
        let usn = self.stream.read_i64()?;
        let timestamp = self.stream.read_i64()?;
        let reason = self.stream.read_u32()?;
        let source_info = self.stream.read_u32()?;
        let security_id = self.stream.read_u32()?;
        let file_attributes = self.stream.read_u32()?;
        let filename_length = self.stream.read_u16()?;
        let filename_offset = self.stream.read_u16()?;

        self.stream.seek_to(start + u64::from(filename_offset))?;
        let name_bytes = self.stream.read_raw(filename_length as usize)?;
        let filename = interpret_bytes_as_utf16(&name_bytes).unwrap_or_default();

        Ok(UsnRecordV2 {
            major_version,
            minor_version,
            file_ref,
            parent_file_ref,
            usn,
            timestamp,
            reason,
            source_info,
            security_id,
            file_attributes,
            filename,
        })
    }

    /// Walks the whole journal and emits one event per v2 record,
    /// correlated against the MFT path index. Malformed records terminate
    /// the walk cleanly and keep whatever was collected.
    pub fn collect_events(
        mut self,
        path_index: &HashMap<u64, PathIndexEntry>,
    ) -> Vec<TimelineEvent> {
        let mut events = Vec::new();

        let first = match self.find_first_record() {
            Ok(Some(offset)) => offset,
            Ok(None) => {
                tracing::warn!("USN journal holds no records");
                return events;
            }
            Err(err) => {
                tracing::warn!("USN journal scan failed: {}", err);
                return events;
            }
        };
        if self.stream.seek_to(first).is_err() {
            return events;
        }

        loop {
            let next = match self.find_next_record() {
                Ok(Some(next)) => next,
                _ => break,
            };
            let record = match self.read_record() {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!("stopping USN walk on malformed record: {}", err);
                    break;
                }
            };
            if record.major_version == 2 {
                events.push(correlate(&record, path_index));
            }
            if self.stream.seek_to(next).is_err() || next >= self.size {
                break;
            }
        }

        events
    }
}

/// Resolves the event path through the path index. The journal's own
/// filename wins whenever it disagrees with the indexed basename.
fn correlate(record: &UsnRecordV2, path_index: &HashMap<u64, PathIndexEntry>) -> TimelineEvent {
    let entry_number = record.entry_number();

    let (full_path, file_size) = match path_index.get(&entry_number) {
        Some(indexed) => {
            let basename = indexed
                .full_path
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(indexed.full_path.as_str());
            if !record.filename.is_empty() && !basename.ends_with(record.filename.as_str()) {
                (record.filename.clone(), indexed.file_size)
            } else {
                (indexed.full_path.clone(), indexed.file_size)
            }
        }
        None => {
            if record.filename.is_empty() {
                tracing::warn!(
                    "USN entry {} is unknown to the MFT and carries no name",
                    entry_number
                );
            }
            (record.filename.clone(), 0)
        }
    };

    TimelineEvent {
        date: record.timestamp_utc(),
        file_size,
        date_flags: MacbMask::empty(),
        full_path,
        inode: entry_number,
        flags: format!("(USN: {})", reason_tokens(record.reason)),
        ftype: file_attribute_tokens(record.file_attributes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    /// Serializes one USN_RECORD_V2 with 8-byte alignment padding.
    fn synth_record(
        file_ref: u64,
        parent_ref: u64,
        timestamp: i64,
        reason: u32,
        attributes: u32,
        name: &str,
    ) -> Vec<u8> {
        let name_bytes: Vec<u8> = name
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let unpadded = 60 + name_bytes.len();
        let record_length = (unpadded + 7) / 8 * 8;

        let mut buf = Vec::with_capacity(record_length);
        buf.extend_from_slice(&(record_length as u32).to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes()); // major
        buf.extend_from_slice(&0u16.to_le_bytes()); // minor
        buf.extend_from_slice(&file_ref.to_le_bytes());
        buf.extend_from_slice(&parent_ref.to_le_bytes());
        buf.extend_from_slice(&0x1000i64.to_le_bytes()); // usn
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(&reason.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // source info
        buf.extend_from_slice(&0u32.to_le_bytes()); // security id
        buf.extend_from_slice(&attributes.to_le_bytes());
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&60u16.to_le_bytes()); // filename offset
        buf.extend_from_slice(&name_bytes);
        buf.resize(record_length, 0);
        buf
    }

    fn write_journal(leading_zeroes: usize, records: &[Vec<u8>]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("UsnJrnl");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; leading_zeroes]).unwrap();
        for record in records {
            file.write_all(record).unwrap();
        }
        file.flush().unwrap();
        (dir, path)
    }

    #[test]
    fn filetime_epoch_properties() {
        assert_eq!(filetime_to_utc(0).timestamp(), -11_644_473_600);
        assert_eq!(filetime_to_utc(116_444_736_000_000_000).timestamp(), 0);
    }

    #[test]
    fn reason_tokens_are_in_mask_order() {
        assert_eq!(reason_tokens(0x102), "DATA_EXTEND FILE_CREATE");
        assert_eq!(reason_tokens(0x8000_0100), "FILE_CREATE CLOSE");
        assert_eq!(reason_tokens(0), "");
    }

    #[test]
    fn header_fields_round_trip() {
        let file_ref = 1234 | (7u64 << 48);
        let parent = 5 | (3u64 << 48);
        let record_bytes = synth_record(file_ref, parent, 42, 0x800, 0x4, "conf");
        let (_dir, path) = write_journal(0, &[record_bytes]);

        let mut parser = UsnJournalParser::open(&path).unwrap();
        parser.stream.seek_to(0).unwrap();
        let record = parser.read_record().unwrap();

        assert_eq!(record.major_version, 2);
        assert_eq!(record.minor_version, 0);
        assert_eq!(record.entry_number(), 1234);
        assert_eq!(record.seq_number(), 7);
        assert_eq!(record.parent_entry_number(), 5);
        assert_eq!(record.usn, 0x1000);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.reason, 0x800);
        assert_eq!(record.source_info, 0);
        assert_eq!(record.security_id, 0);
        assert_eq!(record.file_attributes, 0x4);
        assert_eq!(record.filename, "conf");
    }

    #[test]
    fn file_reference_split() {
        let record = synth_record(5 | (3u64 << 48), 0, 0, 0, 0, "x");
        let (_dir, path) = write_journal(0, &[record]);
        let events =
            UsnJournalParser::open(&path).unwrap().collect_events(&HashMap::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].inode, 5);
    }

    #[test]
    fn walks_padded_records_behind_a_zero_run() {
        let ticks = 132_514_560_000_000_000i64;
        let records = vec![
            synth_record(5, 2, ticks, 0x102, 0, "x"),
            synth_record(6, 2, ticks + 10_000_000, 0x8000_0000, 0x20, "y.txt"),
        ];
        // 128 KiB zero run, then a few stray padding words between records.
        let mut body = records[0].clone();
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(&records[1]);
        let (_dir, path) = write_journal(128 * 1024, &[body]);

        let events =
            UsnJournalParser::open(&path).unwrap().collect_events(&HashMap::new());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].full_path, "x");
        assert_eq!(events[0].flags, "(USN: DATA_EXTEND FILE_CREATE)");
        assert_eq!(events[1].full_path, "y.txt");
        assert_eq!(events[1].ftype, "ARCHIVE");
        assert_eq!(events[1].flags, "(USN: CLOSE)");
    }

    #[test]
    fn truncated_record_terminates_cleanly() {
        let ticks = 132_514_560_000_000_000i64;
        let good = synth_record(5, 2, ticks, 0x2, 0, "x");
        let mut bad = synth_record(6, 2, ticks, 0x2, 0, "y");
        bad.truncate(20); // header claims more than the file holds
        let (_dir, path) = write_journal(0, &[good, bad]);

        let events =
            UsnJournalParser::open(&path).unwrap().collect_events(&HashMap::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].inode, 5);
    }

    #[test]
    fn correlation_prefers_the_index_path_when_basenames_agree() {
        let mut index = HashMap::new();
        index.insert(
            5,
            PathIndexEntry {
                full_path: "C:/tmp/x".to_string(),
                file_size: 77,
                access_time: filetime_to_utc(0),
            },
        );

        let record = synth_record(5, 2, 132_514_560_000_000_000, 0x102, 0, "x");
        let (_dir, path) = write_journal(0, &[record]);
        let events = UsnJournalParser::open(&path).unwrap().collect_events(&index);

        assert_eq!(events[0].full_path, "C:/tmp/x");
        assert_eq!(events[0].file_size, 77);
        assert_eq!(events[0].date_flags.as_str(), "....");
    }

    #[test]
    fn correlation_prefers_the_journal_name_on_mismatch() {
        let mut index = HashMap::new();
        index.insert(
            5,
            PathIndexEntry {
                full_path: "C:/tmp/old-name".to_string(),
                file_size: 77,
                access_time: filetime_to_utc(0),
            },
        );

        let record = synth_record(5, 2, 132_514_560_000_000_000, 0x2000, 0, "renamed.txt");
        let (_dir, path) = write_journal(0, &[record]);
        let events = UsnJournalParser::open(&path).unwrap().collect_events(&index);

        assert_eq!(events[0].full_path, "renamed.txt");
        assert_eq!(events[0].file_size, 77);
    }

    #[test]
    fn unknown_entry_falls_back_to_the_journal_name_and_zero_size() {
        let record = synth_record(42, 2, 132_514_560_000_000_000, 0x100, 0, "ghost.bin");
        let (_dir, path) = write_journal(0, &[record]);
        let events =
            UsnJournalParser::open(&path).unwrap().collect_events(&HashMap::new());
        assert_eq!(events[0].full_path, "ghost.bin");
        assert_eq!(events[0].file_size, 0);
    }
}
