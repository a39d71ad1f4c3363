use std::path::PathBuf;
use std::process::ExitCode;

use chrono_tz::Tz;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{row, Table};
use tracing_subscriber::EnvFilter;

mod bytestream;
mod error;
mod loader;
mod mft;
mod resident;
mod timeline;
mod usn;
mod writer;

use crate::error::MactimeError;
use crate::resident::{ResidentExtractor, RuleScanner};

#[derive(Debug, Parser)]
#[command(
    name = "mftmactime",
    version,
    about = "Utility to create a mactime format filesystem timeline from MFT"
)]
struct Arguments {
    /// MFT artifact or raw NTFS image
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Output timeline file: Ex: mft.csv
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Drive letter: Ex: C
    #[arg(short = 'm', long = "drive", default_value = "C")]
    drive: String,

    /// Extract X30 attributes ($FILE_NAME) too
    #[arg(short = 'n', long = "filenameattr")]
    filenameattr: bool,

    /// Output timezone, IANA name (UTC default): Ex: Europe/Madrid
    #[arg(long = "timezone", alias = "tz")]
    timezone: Option<String>,

    /// Output path for dumped MFT resident data
    #[arg(short = 'r', long = "resident")]
    resident: Option<PathBuf>,

    /// USN journal source: a $UsnJrnl:$J dump or a raw NTFS image
    #[arg(short = 'u', long = "usn")]
    usn: Option<PathBuf>,

    /// Partition offset in bytes inside a raw image
    #[arg(short = 's', long = "offset", default_value_t = 0)]
    offset: u64,

    /// Scratch directory for artifacts extracted from a raw image
    #[arg(short = 'd', long = "dump-dir")]
    dump_dir: Option<PathBuf>,

    /// YARA source rules to scan resident data with
    #[arg(short = 'y', long = "yara")]
    yara: Option<PathBuf>,

    /// Precompiled YARA rules
    #[arg(long = "yara-compiled", alias = "yc")]
    yara_compiled: Option<PathBuf>,

    /// Dump resident files only when a YARA rule matches
    #[arg(long = "resident-yara-only", alias = "ry")]
    resident_yara_only: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let arguments = Arguments::parse();
    match run(arguments) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(arguments: Arguments) -> anyhow::Result<()> {
    let timezone = arguments
        .timezone
        .as_deref()
        .map(|name| {
            name.parse::<Tz>()
                .map_err(|_| MactimeError::InvalidTimeZone(name.to_string()))
        })
        .transpose()?;

    if !arguments.file.exists() {
        return Err(MactimeError::InputMissing(arguments.file).into());
    }

    let scanner = load_scanner(&arguments)?;

    // Locate the MFT artifact, extracting it from a raw image when needed.
    let mft_path = match loader::classify(&arguments.file, arguments.offset)? {
        loader::Evidence::Mft => arguments.file.clone(),
        loader::Evidence::Ntfs => {
            let scratch = arguments
                .dump_dir
                .as_deref()
                .ok_or(MactimeError::RawImageWithoutScratch)?;
            loader::dump_by_inode(
                &arguments.file,
                arguments.offset,
                loader::MFT_INODE,
                scratch,
                "MFT",
            )?
        }
        loader::Evidence::Unsupported => {
            return Err(MactimeError::InputUnsupported(arguments.file).into())
        }
    };

    if arguments.resident_yara_only.is_some() && scanner.is_none() {
        return Err(MactimeError::YaraLoad(
            "resident-yara-only mode needs YARA rules (-y or --yara-compiled)".to_string(),
        )
        .into());
    }

    let (resident_dir, yara_only) = match (&arguments.resident, &arguments.resident_yara_only) {
        (Some(dir), _) => (Some(dir.clone()), false),
        (None, Some(dir)) => (Some(dir.clone()), true),
        (None, None) => (None, false),
    };
    let mut extractor = if resident_dir.is_some() || scanner.is_some() {
        Some(ResidentExtractor::new(resident_dir, yara_only, scanner)?)
    } else {
        None
    };

    let records = mft::FileRecordIter::open(&mft_path)?;
    let progress = ProgressBar::new(records.entry_count());
    progress.set_style(
        ProgressStyle::with_template("  + PARSING MFT: {pos}/{len} {bar:30}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut builder =
        timeline::TimelineBuilder::new(arguments.drive.clone(), arguments.filenameattr);
    for record in records {
        builder.process_record(&record, extractor.as_mut());
        progress.inc(1);
    }
    progress.finish_and_clear();

    let mut usn_events = Vec::new();
    if let Some(usn_source) = &arguments.usn {
        if !usn_source.exists() {
            return Err(MactimeError::InputMissing(usn_source.clone()).into());
        }
        let journal = match loader::classify(usn_source, arguments.offset)? {
            loader::Evidence::Ntfs => {
                let scratch = arguments
                    .dump_dir
                    .as_deref()
                    .ok_or(MactimeError::RawImageWithoutScratch)?;
                match builder.usn_inode() {
                    Some(inode) => Some(loader::dump_by_inode(
                        usn_source,
                        arguments.offset,
                        inode,
                        scratch,
                        "UsnJrnl",
                    )?),
                    None => {
                        tracing::warn!(
                            "no $UsnJrnl entry discovered in the MFT, skipping USN processing"
                        );
                        None
                    }
                }
            }
            loader::Evidence::Mft => {
                return Err(MactimeError::InputUnsupported(usn_source.clone()).into())
            }
            // Dumped $J payloads start with zero fill, not magic.
            loader::Evidence::Unsupported => Some(usn_source.clone()),
        };
        if let Some(journal) = journal {
            usn_events =
                usn::UsnJournalParser::open(&journal)?.collect_events(builder.path_index());
        }
    }

    let records_seen = builder.records_seen();
    let usn_count = usn_events.len();
    let (mut events, _path_index) = builder.finish();
    events.extend(usn_events);

    writer::sort_events(&mut events);
    writer::write_body_file(&events, &arguments.output, timezone)?;

    let mut table = Table::new();
    table.add_row(row![
        "MFT RECORDS",
        "TIMELINE EVENTS",
        "USN EVENTS",
        "RESIDENT RECOVERED",
        "DELETED RESIDENT"
    ]);
    table.add_row(row![
        records_seen,
        events.len(),
        usn_count,
        extractor.as_ref().map_or(0, |e| e.recovered()),
        extractor.as_ref().map_or(0, |e| e.recovered_deleted())
    ]);
    table.printstd();

    if let Some(path) = extractor.as_ref().and_then(|e| e.summary_path()) {
        println!("  + RECOVERY REPORT FILE: {}", path.display());
    }
    println!("  + TIMELINE SAVED: {}", arguments.output.display());

    Ok(())
}

#[cfg(feature = "yara")]
fn load_scanner(arguments: &Arguments) -> Result<Option<RuleScanner>, MactimeError> {
    if let Some(path) = &arguments.yara {
        return Ok(Some(RuleScanner::from_source(path)?));
    }
    if let Some(path) = &arguments.yara_compiled {
        return Ok(Some(RuleScanner::from_compiled(path)?));
    }
    Ok(None)
}

#[cfg(not(feature = "yara"))]
fn load_scanner(arguments: &Arguments) -> Result<Option<RuleScanner>, MactimeError> {
    if arguments.yara.is_some() || arguments.yara_compiled.is_some() {
        return Err(MactimeError::YaraLoad(
            "this build does not include YARA support (rebuild with the `yara` feature)"
                .to_string(),
        ));
    }
    Ok(None)
}
