use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use mft::attribute::header::ResidentialHeader;
use mft::attribute::{MftAttributeContent, MftAttributeType};
use mft::entry::EntryFlags;
use mft::{MftEntry, MftParser};

use crate::error::MactimeError;

/// Windows file-attribute bits, in canonical mask order. Shared between the
/// $STANDARD_INFORMATION / $FILE_NAME flag decoding and the USN
/// `file_attributes` field.
pub const FILE_ATTRIBUTE_TOKENS: &[(u32, &str)] = &[
    (0x0000_0001, "READONLY"),
    (0x0000_0002, "HIDDEN"),
    (0x0000_0004, "SYSTEM"),
    (0x0000_0010, "DIRECTORY"),
    (0x0000_0020, "ARCHIVE"),
    (0x0000_0040, "DEVICE"),
    (0x0000_0080, "NORMAL"),
    (0x0000_0100, "TEMPORARY"),
    (0x0000_0200, "SPARSE_FILE"),
    (0x0000_0400, "REPARSE_POINT"),
    (0x0000_0800, "COMPRESSED"),
    (0x0000_1000, "OFFLINE"),
    (0x0000_2000, "NOT_CONTENT_INDEXED"),
    (0x0000_4000, "ENCRYPTED"),
    (0x0000_8000, "INTEGRITY_STREAM"),
    (0x0001_0000, "VIRTUAL"),
    (0x0002_0000, "NO_SCRUB_DATA"),
];

pub(crate) fn join_tokens(table: &[(u32, &str)], mask: u32) -> String {
    table
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, token)| *token)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn file_attribute_tokens(mask: u32) -> String {
    join_tokens(FILE_ATTRIBUTE_TOKENS, mask)
}

/// The four NTFS timestamps carried by $STANDARD_INFORMATION and
/// $FILE_NAME, already converted to UTC instants by the decoder.
#[derive(Debug, Clone, Copy)]
pub struct TimestampQuad {
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub mft_modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// Attribute payloads the timeline builder dispatches on.
#[derive(Debug, Clone)]
pub enum AttributeData {
    /// X10, with its file flags decoded to tokens.
    StandardInformation {
        times: TimestampQuad,
        file_flags: String,
    },
    /// X30, with its flags decoded to tokens.
    FileName { times: TimestampQuad, flags: String },
    /// X80. `resident` holds the inline payload when the stream is resident.
    Data { resident: Option<Vec<u8>> },
    Other,
}

/// One attribute of a file record, flattened from the decoder's view.
#[derive(Debug, Clone)]
pub struct RecordAttribute {
    /// Non-empty for alternate data streams.
    pub name: Option<String>,
    pub is_resident: bool,
    pub data_size: u64,
    pub content: AttributeData,
}

/// One decoded MFT file record, shaped for timeline building.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub entry_id: u64,
    /// 0 for base records, the owning record id for extension records.
    pub base_entry_id: u64,
    /// Volume-root-relative path, empty when the record carries no name.
    pub full_path: String,
    /// Size of the record's first $DATA attribute, 0 when there is none.
    pub file_size: u64,
    pub allocated: bool,
    /// Entry flag tokens, e.g. "ALLOCATED INDEX_PRESENT".
    pub flags: String,
    pub attributes: Vec<RecordAttribute>,
}

/// Streams `FileRecord`s out of a standalone MFT file in on-disk record
/// order. Records that fail to decode are skipped, never fatal.
pub struct FileRecordIter {
    parser: MftParser<BufReader<File>>,
    total: u64,
    next: u64,
}

impl FileRecordIter {
    pub fn open(path: &Path) -> Result<Self, MactimeError> {
        let parser = MftParser::from_path(path)?;
        let total = parser.get_entry_count();
        Ok(Self {
            parser,
            total,
            next: 0,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.total
    }
}

impl Iterator for FileRecordIter {
    type Item = FileRecord;

    fn next(&mut self) -> Option<FileRecord> {
        while self.next < self.total {
            let number = self.next;
            self.next += 1;
            match self.parser.get_entry(number) {
                Ok(entry) => return Some(flatten_entry(&entry, &mut self.parser)),
                Err(err) => {
                    tracing::trace!("skipping record {}: {}", number, err);
                }
            }
        }
        None
    }
}

fn entry_flags_tokens(flags: EntryFlags) -> String {
    let mut tokens = Vec::new();
    if flags.contains(EntryFlags::ALLOCATED) {
        tokens.push("ALLOCATED");
    }
    if flags.contains(EntryFlags::INDEX_PRESENT) {
        tokens.push("INDEX_PRESENT");
    }
    tokens.join(" ")
}

fn flatten_entry(
    entry: &MftEntry,
    parser: &mut MftParser<BufReader<File>>,
) -> FileRecord {
    let mut attributes = Vec::new();
    let mut file_size = None;

    for attribute in entry.iter_attributes() {
        let attribute = match attribute {
            Ok(attribute) => attribute,
            Err(err) => {
                tracing::trace!(
                    "skipping attribute of record {}: {}",
                    entry.header.record_number,
                    err
                );
                continue;
            }
        };

        let name = if attribute.header.name.is_empty() {
            None
        } else {
            Some(attribute.header.name.clone())
        };
        let (is_resident, data_size) = match &attribute.header.residential_header {
            ResidentialHeader::Resident(resident) => (true, u64::from(resident.data_size)),
            ResidentialHeader::NonResident(non_resident) => (false, non_resident.file_size),
        };

        if attribute.header.type_code == MftAttributeType::DATA && file_size.is_none() {
            file_size = Some(data_size);
        }

        let content = match attribute.data {
            MftAttributeContent::AttrX10(info) => AttributeData::StandardInformation {
                times: TimestampQuad {
                    modified: info.modified,
                    accessed: info.accessed,
                    mft_modified: info.mft_modified,
                    created: info.created,
                },
                file_flags: file_attribute_tokens(info.file_flags.bits()),
            },
            MftAttributeContent::AttrX30(file_name) => AttributeData::FileName {
                times: TimestampQuad {
                    modified: file_name.modified,
                    accessed: file_name.accessed,
                    mft_modified: file_name.mft_modified,
                    created: file_name.created,
                },
                flags: file_attribute_tokens(file_name.flags.bits()),
            },
            MftAttributeContent::AttrX80(data) => AttributeData::Data {
                resident: Some(data.data().to_vec()),
            },
            _ if attribute.header.type_code == MftAttributeType::DATA => {
                AttributeData::Data { resident: None }
            }
            _ => AttributeData::Other,
        };

        attributes.push(RecordAttribute {
            name,
            is_resident,
            data_size,
            content,
        });
    }

    let full_path = match parser.get_full_path_for_entry(entry) {
        Ok(Some(path)) => path.to_string_lossy().into_owned(),
        Ok(None) => String::new(),
        Err(err) => {
            tracing::trace!(
                "no path for record {}: {}",
                entry.header.record_number,
                err
            );
            String::new()
        }
    };

    FileRecord {
        entry_id: entry.header.record_number,
        base_entry_id: entry.header.base_reference.entry,
        full_path,
        file_size: file_size.unwrap_or(0),
        allocated: entry.header.flags.contains(EntryFlags::ALLOCATED),
        flags: entry_flags_tokens(entry.header.flags),
        attributes,
    }
}

/// Builders for synthetic 1024-byte FILE records, shared by the module
/// tests and the timeline tests.
#[cfg(test)]
pub(crate) mod synth {
    use std::io::Write;
    use std::path::PathBuf;

    pub const ROOT_ENTRY: u64 = 5;
    const SEQUENCE: u16 = 1;
    const UPDATE_SEQ: u16 = 0xBEEF;

    pub fn filetime(unix_seconds: i64) -> u64 {
        ((unix_seconds + 11_644_473_600) * 10_000_000) as u64
    }

    /// Parent reference with our fixed sequence number in the top word.
    pub fn parent_ref(entry: u64) -> u64 {
        entry | (u64::from(SEQUENCE) << 48)
    }

    pub struct X30Spec {
        pub parent: u64,
        pub name: &'static str,
        pub times: [u64; 4],
        pub flags: u32,
        pub logical_size: u64,
    }

    #[derive(Default)]
    pub struct SynthRecord {
        pub record_number: u32,
        pub base_entry: u64,
        /// 0x01 = in use, 0x02 = directory index present.
        pub header_flags: u16,
        /// created, modified, mft_modified, accessed — on-disk order.
        pub x10_times: Option<[u64; 4]>,
        pub x10_flags: u32,
        pub x30: Option<X30Spec>,
        /// Resident $DATA streams; names must be 4 characters so the value
        /// stays 8-aligned without padding.
        pub data_streams: Vec<(Option<&'static str>, Vec<u8>)>,
    }

    fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn push_attribute_header(
        buf: &mut [u8],
        offset: usize,
        type_code: u32,
        length: u32,
        name: Option<&str>,
        data_size: u32,
        data_offset: u16,
    ) {
        put_u32(buf, offset, type_code);
        put_u32(buf, offset + 4, length);
        buf[offset + 8] = 0; // resident
        buf[offset + 9] = name.map_or(0, |n| n.len() as u8);
        put_u16(buf, offset + 10, if name.is_some() { 24 } else { 0 });
        put_u16(buf, offset + 12, 0); // data flags
        put_u16(buf, offset + 14, 0); // attribute id
        put_u32(buf, offset + 16, data_size);
        put_u16(buf, offset + 20, data_offset);
        buf[offset + 22] = 0; // indexed flag
        buf[offset + 23] = 0;
        if let Some(n) = name {
            for (i, unit) in n.encode_utf16().enumerate() {
                put_u16(buf, offset + 24 + i * 2, unit);
            }
        }
    }

    fn push_x10(buf: &mut [u8], offset: usize, times: &[u64; 4], flags: u32) -> usize {
        push_attribute_header(buf, offset, 0x10, 24 + 72, None, 72, 24);
        let content = offset + 24;
        for (i, time) in times.iter().enumerate() {
            put_u64(buf, content + i * 8, *time);
        }
        put_u32(buf, content + 32, flags);
        offset + 24 + 72
    }

    fn push_x30(buf: &mut [u8], offset: usize, spec: &X30Spec) -> usize {
        let name_units = spec.name.encode_utf16().count();
        let content_size = 66 + name_units * 2;
        let length = ((24 + content_size + 7) / 8) * 8;
        push_attribute_header(
            buf,
            offset,
            0x30,
            length as u32,
            None,
            content_size as u32,
            24,
        );
        let content = offset + 24;
        put_u64(buf, content, spec.parent);
        for (i, time) in spec.times.iter().enumerate() {
            put_u64(buf, content + 8 + i * 8, *time);
        }
        put_u64(buf, content + 40, spec.logical_size);
        put_u64(buf, content + 48, spec.logical_size);
        put_u32(buf, content + 56, spec.flags);
        put_u32(buf, content + 60, 0); // reparse value
        buf[content + 64] = name_units as u8;
        buf[content + 65] = 1; // Win32 namespace
        for (i, unit) in spec.name.encode_utf16().enumerate() {
            put_u16(buf, content + 66 + i * 2, unit);
        }
        offset + length
    }

    fn push_data(
        buf: &mut [u8],
        offset: usize,
        name: Option<&'static str>,
        data: &[u8],
    ) -> usize {
        let name_units = name.map_or(0, |n| n.encode_utf16().count());
        assert!(name_units % 4 == 0, "test stream names must stay 8-aligned");
        let data_offset = 24 + name_units * 2;
        let length = ((data_offset + data.len() + 7) / 8) * 8;
        push_attribute_header(
            buf,
            offset,
            0x80,
            length as u32,
            name,
            data.len() as u32,
            data_offset as u16,
        );
        buf[offset + data_offset..offset + data_offset + data.len()].copy_from_slice(data);
        offset + length
    }

    pub fn build_record(spec: &SynthRecord) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[0..4].copy_from_slice(b"FILE");
        put_u16(&mut buf, 0x04, 48); // update sequence array offset
        put_u16(&mut buf, 0x06, 3); // update sequence array size
        put_u16(&mut buf, 0x10, SEQUENCE);
        put_u16(&mut buf, 0x12, 1); // hard link count
        put_u16(&mut buf, 0x14, 0x38); // first attribute offset
        put_u16(&mut buf, 0x16, spec.header_flags);
        put_u32(&mut buf, 0x1C, 1024); // total entry size
        put_u64(&mut buf, 0x20, spec.base_entry);
        put_u16(&mut buf, 0x28, 4); // next attribute id
        put_u32(&mut buf, 0x2C, spec.record_number);

        // Update sequence value plus the two saved sector-tail words (the
        // original content there is zero).
        put_u16(&mut buf, 0x30, UPDATE_SEQ);
        put_u16(&mut buf, 510, UPDATE_SEQ);
        put_u16(&mut buf, 1022, UPDATE_SEQ);

        let mut offset = 0x38;
        if let Some(times) = &spec.x10_times {
            offset = push_x10(&mut buf, offset, times, spec.x10_flags);
        }
        if let Some(x30) = &spec.x30 {
            offset = push_x30(&mut buf, offset, x30);
        }
        for (name, data) in &spec.data_streams {
            offset = push_data(&mut buf, offset, *name, data);
        }
        assert!(offset + 8 <= 510, "synthetic record overflows first sector");
        put_u32(&mut buf, offset, 0xFFFF_FFFF);
        put_u32(&mut buf, 0x18, (offset + 8) as u32); // used entry size

        buf
    }

    /// Writes the records into slot positions of a synthetic MFT file;
    /// unoccupied slots stay zeroed and are skipped by the iterator.
    pub fn write_mft_file(records: &[(u64, Vec<u8>)]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("MFT");
        let slots = records.iter().map(|(slot, _)| *slot).max().unwrap_or(0) + 1;
        let mut image = vec![0u8; (slots * 1024) as usize];
        for (slot, record) in records {
            let start = (*slot * 1024) as usize;
            image[start..start + 1024].copy_from_slice(record);
        }
        let mut file = std::fs::File::create(&path).expect("create synthetic MFT");
        file.write_all(&image).expect("write synthetic MFT");
        (dir, path)
    }
}
