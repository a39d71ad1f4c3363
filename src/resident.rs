use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(feature = "yara")]
use crate::error::MactimeError;
use crate::mft::FileRecord;

/// Compiled detection rules matched against resident payloads.
///
/// Rule compilation and loading are delegated to the YARA engine; the glue
/// here only carries compiled rules and reports the first matching rule
/// name per buffer.
#[cfg(feature = "yara")]
pub struct RuleScanner {
    rules: yara_x::Rules,
}

#[cfg(feature = "yara")]
impl RuleScanner {
    pub fn from_source(path: &Path) -> Result<Self, MactimeError> {
        let source = fs::read_to_string(path)?;
        let rules = yara_x::compile(source.as_str())
            .map_err(|err| MactimeError::YaraLoad(err.to_string()))?;
        Ok(Self { rules })
    }

    pub fn from_compiled(path: &Path) -> Result<Self, MactimeError> {
        let data = fs::read(path)?;
        let rules = yara_x::Rules::deserialize(&data)
            .map_err(|err| MactimeError::YaraLoad(err.to_string()))?;
        Ok(Self { rules })
    }

    pub fn first_match(&self, data: &[u8]) -> Option<String> {
        let mut scanner = yara_x::Scanner::new(&self.rules);
        let results = scanner.scan(data).ok()?;
        results
            .matching_rules()
            .next()
            .map(|rule| rule.identifier().to_string())
    }
}

#[cfg(not(feature = "yara"))]
pub struct RuleScanner;

#[cfg(not(feature = "yara"))]
impl RuleScanner {
    pub fn first_match(&self, _data: &[u8]) -> Option<String> {
        None
    }
}

/// Recovers resident $DATA payloads into a mirror of the volume tree and
/// keeps the recovery summary. A dump failure never aborts the timeline.
pub struct ResidentExtractor {
    dump_dir: Option<PathBuf>,
    yara_only: bool,
    scanner: Option<RuleScanner>,
    summary: Option<File>,
    summary_path: Option<PathBuf>,
    recovered: u64,
    recovered_deleted: u64,
}

impl ResidentExtractor {
    pub fn new(
        dump_dir: Option<PathBuf>,
        yara_only: bool,
        scanner: Option<RuleScanner>,
    ) -> io::Result<Self> {
        let (summary, summary_path) = match &dump_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join("resident_summary.txt");
                let mut file = File::create(&path)?;
                writeln!(file, "STATUS, FILE PATH")?;
                (Some(file), Some(path))
            }
            None => (None, None),
        };
        Ok(Self {
            dump_dir,
            yara_only,
            scanner,
            summary,
            summary_path,
            recovered: 0,
            recovered_deleted: 0,
        })
    }

    pub fn recovered(&self) -> u64 {
        self.recovered
    }

    pub fn recovered_deleted(&self) -> u64 {
        self.recovered_deleted
    }

    pub fn summary_path(&self) -> Option<&Path> {
        self.summary_path.as_deref()
    }

    /// Called once per resident $DATA payload of a record that carried
    /// X10 timestamps.
    pub fn handle(&mut self, record: &FileRecord, ads_name: Option<&str>, data: &[u8]) {
        let resident_path = match ads_name {
            Some(name) => format!("{}:{}", record.full_path, name),
            None => record.full_path.clone(),
        };

        let matched = self
            .scanner
            .as_ref()
            .and_then(|scanner| scanner.first_match(data));
        if let Some(rule) = &matched {
            tracing::info!("YARA rule {} matched {}", rule, resident_path);
        }

        let Some(dump_dir) = &self.dump_dir else {
            return;
        };
        if self.yara_only && matched.is_none() {
            return;
        }

        let status = if record.allocated { "ALLOCATED" } else { "DELETED" };
        if let Err(err) = write_payload(dump_dir, &resident_path, data) {
            tracing::warn!("failed to dump resident file {}: {}", resident_path, err);
            return;
        }

        self.recovered += 1;
        if !record.allocated {
            self.recovered_deleted += 1;
        }

        if let Some(summary) = &mut self.summary {
            let line = match matched {
                Some(rule) => format!("{},{},YARA MATCHED: {}", status, resident_path, rule),
                None => format!("{},{}", status, resident_path),
            };
            if let Err(err) = writeln!(summary, "{}", line) {
                tracing::warn!("failed to append recovery summary line: {}", err);
            }
        }
    }
}

fn write_payload(dump_dir: &Path, resident_path: &str, data: &[u8]) -> io::Result<()> {
    let destination = dump_dir.join(resident_path);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(destination, data)
}
