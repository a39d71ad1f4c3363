use std::path::PathBuf;

use thiserror::Error;

/// Fatal and propagated error kinds for the timeline pipeline. Individual
/// record decode failures are not represented here; they are skipped at the
/// iterator level.
#[derive(Debug, Error)]
pub enum MactimeError {
    #[error("Evidence file not found: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("Unsupported evidence header: {}", .0.display())]
    InputUnsupported(PathBuf),

    #[error("Dump path is required for RAW Evidence")]
    RawImageWithoutScratch,

    #[error("Invalid timezone string: {0}")]
    InvalidTimeZone(String),

    #[error("Unable to load YARA rules: {0}")]
    YaraLoad(String),

    #[error("Inode {0} has no $DATA attribute")]
    NoDataAttribute(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("NTFS volume error: {0}")]
    Ntfs(#[from] ntfs::NtfsError),

    #[error("MFT decode error: {0}")]
    Mft(#[from] mft::err::Error),

    #[error("Timeline write error: {0}")]
    Csv(#[from] csv::Error),
}
