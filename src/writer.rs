use std::path::Path;

use chrono_tz::Tz;
use csv::{QuoteStyle, WriterBuilder};

use crate::error::MactimeError;
use crate::timeline::TimelineEvent;

/// mactime date cell, e.g. `Wed Jan 01 2020 00:00:00 (UTC)`.
const DATE_FORMAT: &str = "%a %b %d %Y %H:%M:%S (%Z)";

/// Stable ascending sort by event time; equal instants keep their
/// collection order.
pub fn sort_events(events: &mut [TimelineEvent]) {
    events.sort_by_key(|event| event.date);
}

/// Writes the sorted events as a mactime body file. The body format is not
/// quoted CSV, so the writer never quotes; a caller-supplied zone re-zones
/// every instant before formatting.
pub fn write_body_file(
    events: &[TimelineEvent],
    output: &Path,
    timezone: Option<Tz>,
) -> Result<(), MactimeError> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Never)
        .from_path(output)?;

    writer.write_record(["Date", "Size", "Type", "Mode", "UID", "GID", "Meta", "File Name"])?;

    for event in events {
        let date = match timezone {
            Some(tz) => event.date.with_timezone(&tz).format(DATE_FORMAT).to_string(),
            None => event.date.format(DATE_FORMAT).to_string(),
        };
        writer.write_record(&[
            date,
            event.file_size.to_string(),
            event.date_flags.as_str().to_string(),
            mode_cell(&event.ftype).to_string(),
            "0".to_string(),
            "0".to_string(),
            event.inode.to_string(),
            format!("{} {}", event.full_path, name_suffix(&event.flags)),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn mode_cell(ftype: &str) -> &'static str {
    if ftype.split(' ').any(|token| token == "DIRECTORY") {
        "d/drwxrwxrwx"
    } else {
        "-/-rwxrwxrwx"
    }
}

/// Allocated entries carry no suffix, journal events carry their reason
/// string, everything else reads as deleted.
fn name_suffix(flags: &str) -> &str {
    if flags.split(' ').any(|token| token == "ALLOCATED") {
        ""
    } else if flags.starts_with("(USN") {
        flags
    } else {
        "(deleted)"
    }
}
