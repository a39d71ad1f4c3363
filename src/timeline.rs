use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::mft::{AttributeData, FileRecord, TimestampQuad};
use crate::resident::ResidentExtractor;

/// Journal streams below this size are not worth correlating.
const USN_MIN_SIZE: u64 = 1024 * 1024;

/// Timestamp roles, indexed into the four-character mactime mask.
#[derive(Debug, Clone, Copy)]
pub enum MacbRole {
    Modified = 0,
    Accessed = 1,
    Changed = 2,
    Born = 3,
}

impl MacbRole {
    fn letter(self) -> u8 {
        match self {
            MacbRole::Modified => b'm',
            MacbRole::Accessed => b'a',
            MacbRole::Changed => b'c',
            MacbRole::Born => b'b',
        }
    }
}

/// Four-character "macb" mask. Each position holds its role letter or a
/// dot, so two roles sharing one instant show both letters in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacbMask([u8; 4]);

impl MacbMask {
    pub fn empty() -> Self {
        MacbMask(*b"....")
    }

    pub fn set(&mut self, role: MacbRole) {
        self.0[role as usize] = role.letter();
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("....")
    }
}

/// One line of the timeline, prior to formatting.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub date: DateTime<Utc>,
    pub file_size: u64,
    pub date_flags: MacbMask,
    pub full_path: String,
    pub inode: u64,
    pub flags: String,
    pub ftype: String,
}

/// What the MFT pass remembers about an entry for the USN pass and for
/// flushing cross-record ADS events.
#[derive(Debug, Clone)]
pub struct PathIndexEntry {
    pub full_path: String,
    pub file_size: u64,
    pub access_time: DateTime<Utc>,
}

/// Builds timeline events out of the MFT record stream.
///
/// Extension records may precede or follow their base record in on-disk
/// order, so alternate-data-stream info seen on an extension is buffered
/// keyed by base id and flushed once the whole MFT has been walked.
pub struct TimelineBuilder {
    drive_letter: String,
    with_file_names: bool,
    events: Vec<TimelineEvent>,
    path_index: HashMap<u64, PathIndexEntry>,
    pending_ads: BTreeMap<u64, (String, u64)>,
    usn_inode: Option<u64>,
    records_seen: u64,
}

impl TimelineBuilder {
    pub fn new(drive_letter: String, with_file_names: bool) -> Self {
        Self {
            drive_letter,
            with_file_names,
            events: Vec::new(),
            path_index: HashMap::new(),
            pending_ads: BTreeMap::new(),
            usn_inode: None,
            records_seen: 0,
        }
    }

    /// Entry id of `$Extend/$UsnJrnl`, when the MFT pass has seen it.
    pub fn usn_inode(&self) -> Option<u64> {
        self.usn_inode
    }

    pub fn path_index(&self) -> &HashMap<u64, PathIndexEntry> {
        &self.path_index
    }

    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    pub fn process_record(
        &mut self,
        record: &FileRecord,
        mut extractor: Option<&mut ResidentExtractor>,
    ) {
        self.records_seen += 1;

        let full_path = format!(
            "{}:{}{}",
            self.drive_letter,
            std::path::MAIN_SEPARATOR,
            record.full_path
        );

        let mut x10_events: BTreeMap<DateTime<Utc>, MacbMask> = BTreeMap::new();
        let mut x30_events: BTreeMap<DateTime<Utc>, MacbMask> = BTreeMap::new();
        let mut ads_resident: Vec<(String, u64)> = Vec::new();
        let mut ftype_x10 = String::new();
        let mut ftype_x30 = String::new();
        let mut access_time: Option<DateTime<Utc>> = None;

        for attribute in &record.attributes {
            match &attribute.content {
                AttributeData::StandardInformation { times, file_flags } => {
                    merge_quad(&mut x10_events, times);
                    ftype_x10 = file_flags.clone();
                    access_time = Some(times.accessed);
                }
                AttributeData::FileName { times, flags } => {
                    if self.with_file_names {
                        merge_quad(&mut x30_events, times);
                        ftype_x30 = flags.clone();
                    }
                }
                AttributeData::Data { .. } => {
                    let Some(name) = &attribute.name else { continue };
                    if attribute.data_size == 0 {
                        continue;
                    }
                    if record.base_entry_id > 0 && record.file_size > 0 {
                        self.pending_ads
                            .insert(record.base_entry_id, (name.clone(), record.file_size));
                    } else if record.base_entry_id > 0 {
                        self.pending_ads
                            .entry(record.base_entry_id)
                            .or_insert_with(|| (name.clone(), attribute.data_size));
                    } else {
                        ads_resident.push((name.clone(), attribute.data_size));
                    }
                }
                AttributeData::Other => {}
            }
        }

        // Resident payload recovery and rule scanning apply only to records
        // that carried data and X10 times.
        if let Some(extractor) = extractor.as_deref_mut() {
            if record.file_size > 0 && !x10_events.is_empty() {
                for attribute in record.attributes.iter().filter(|a| a.is_resident) {
                    if let AttributeData::Data {
                        resident: Some(data),
                    } = &attribute.content
                    {
                        extractor.handle(record, attribute.name.as_deref(), data);
                    }
                }
            }
        }

        if let Some(access) = access_time {
            self.path_index.insert(
                record.entry_id,
                PathIndexEntry {
                    full_path: full_path.clone(),
                    file_size: record.file_size,
                    access_time: access,
                },
            );
        }

        if record.file_size > USN_MIN_SIZE
            && (record.full_path.contains("$Extend/$UsnJrnl")
                || record.full_path.contains("$Extend\\$UsnJrnl"))
        {
            self.usn_inode = Some(record.entry_id);
        }

        for (instant, mask) in &x10_events {
            self.events.push(TimelineEvent {
                date: *instant,
                file_size: record.file_size,
                date_flags: *mask,
                full_path: full_path.clone(),
                inode: record.entry_id,
                flags: record.flags.clone(),
                ftype: ftype_x10.clone(),
            });
            for (ads_name, ads_size) in &ads_resident {
                self.events.push(TimelineEvent {
                    date: *instant,
                    file_size: *ads_size,
                    date_flags: *mask,
                    full_path: format!("{}:{}", full_path, ads_name),
                    inode: record.entry_id,
                    flags: record.flags.clone(),
                    ftype: ftype_x10.clone(),
                });
            }
        }

        // An ADS buffered from an extension record seen earlier belongs to
        // this base record; anchor it at the access time.
        if self.pending_ads.contains_key(&record.entry_id) {
            if let Some(access) = access_time {
                if let Some((ads_name, ads_size)) = self.pending_ads.remove(&record.entry_id) {
                    self.events.push(TimelineEvent {
                        date: access,
                        file_size: ads_size,
                        date_flags: MacbMask::empty(),
                        full_path: format!("{}:{}", full_path, ads_name),
                        inode: record.entry_id,
                        flags: record.flags.clone(),
                        ftype: ftype_x10.clone(),
                    });
                }
            }
        }

        if self.with_file_names {
            for (instant, mask) in &x30_events {
                self.events.push(TimelineEvent {
                    date: *instant,
                    file_size: record.file_size,
                    date_flags: *mask,
                    full_path: format!("{} ($FILE_NAME)", full_path),
                    inode: record.entry_id,
                    flags: record.flags.clone(),
                    ftype: ftype_x30.clone(),
                });
            }
        }
    }

    /// Flushes ADS info whose base record appeared somewhere in the stream
    /// and hands back the collected events with the path index.
    pub fn finish(mut self) -> (Vec<TimelineEvent>, HashMap<u64, PathIndexEntry>) {
        let pending = std::mem::take(&mut self.pending_ads);
        for (base_id, (ads_name, ads_size)) in pending {
            let Some(base) = self.path_index.get(&base_id) else {
                tracing::debug!(
                    "discarding ADS {:?} of unseen base record {}",
                    ads_name,
                    base_id
                );
                continue;
            };
            self.events.push(TimelineEvent {
                date: base.access_time,
                file_size: ads_size,
                date_flags: MacbMask::empty(),
                full_path: format!("{}:{}", base.full_path, ads_name),
                inode: base_id,
                flags: "ALLOCATED".to_string(),
                ftype: String::new(),
            });
        }
        (self.events, self.path_index)
    }
}

fn merge_quad(events: &mut BTreeMap<DateTime<Utc>, MacbMask>, times: &TimestampQuad) {
    for (instant, role) in [
        (times.modified, MacbRole::Modified),
        (times.accessed, MacbRole::Accessed),
        (times.mft_modified, MacbRole::Changed),
        (times.created, MacbRole::Born),
    ] {
        events
            .entry(instant)
            .or_insert_with(MacbMask::empty)
            .set(role);
    }
}
