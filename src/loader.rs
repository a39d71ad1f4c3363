use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use indicatif::{ProgressBar, ProgressStyle};
use ntfs::{Ntfs, NtfsAttributeType, NtfsReadSeek};

use crate::error::MactimeError;

/// File record number of $MFT itself.
pub const MFT_INODE: u64 = 0;

/// Streaming chunk for `dump_by_inode`.
const DUMP_CHUNK: usize = 1024 * 1024;

/// What kind of evidence a given input file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    /// A standalone $MFT dump, starting with the `FILE0` record magic.
    Mft,
    /// A raw NTFS volume (or full disk image) with the boot sector at `offset`.
    Ntfs,
    Unsupported,
}

/// Inspects the evidence header. `FILE0` at offset 0 is a standalone MFT;
/// `NTFS` at `offset + 3` is the boot sector OEM id of a raw volume.
pub fn classify(path: &Path, offset: u64) -> io::Result<Evidence> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 5];
    if file.read_exact(&mut magic).is_ok() && &magic == b"FILE0" {
        return Ok(Evidence::Mft);
    }

    file.seek(SeekFrom::Start(offset + 3))?;
    let mut oem_id = [0u8; 4];
    if file.read_exact(&mut oem_id).is_ok() && &oem_id == b"NTFS" {
        return Ok(Evidence::Ntfs);
    }

    Ok(Evidence::Unsupported)
}

/// Read + Seek view of a disk image that starts at a partition offset, so
/// the NTFS layer sees the volume at position zero.
pub struct OffsetReader<R> {
    inner: R,
    base: u64,
}

impl<R: Seek> OffsetReader<R> {
    pub fn new(mut inner: R, base: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(base))?;
        Ok(Self { inner, base })
    }
}

impl<R: Read> Read for OffsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for OffsetReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => SeekFrom::Start(self.base + p),
            other => other,
        };
        let absolute = self.inner.seek(target)?;
        absolute.checked_sub(self.base).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before partition start")
        })
    }
}

/// Opens the image as an NTFS volume at `offset`, picks the largest $DATA
/// stream of file record `inode` and streams it to `out_dir/out_name` in
/// 1 MiB chunks. $UsnJrnl carries both `$J` and `$Max`, so size decides.
pub fn dump_by_inode(
    image: &Path,
    offset: u64,
    inode: u64,
    out_dir: &Path,
    out_name: &str,
) -> Result<PathBuf, MactimeError> {
    let mut fs = OffsetReader::new(BufReader::new(File::open(image)?), offset)?;
    let ntfs = Ntfs::new(&mut fs)?;
    let record = ntfs.file(&mut fs, inode)?;

    let mut best: Option<(String, u64)> = None;
    let mut attributes = record.attributes();
    while let Some(item) = attributes.next(&mut fs) {
        let item = item?;
        let attribute = item.to_attribute()?;
        if attribute.ty()? != NtfsAttributeType::Data {
            continue;
        }
        let name = attribute.name()?.to_string_lossy();
        let length = attribute.value_length();
        if best.as_ref().map_or(true, |(_, len)| length > *len) {
            best = Some((name, length));
        }
    }
    let (stream_name, stream_length) = best.ok_or(MactimeError::NoDataAttribute(inode))?;

    let data_item = record
        .data(&mut fs, &stream_name)
        .ok_or(MactimeError::NoDataAttribute(inode))??;
    let mut value = data_item.to_attribute()?.value(&mut fs)?;

    fs::create_dir_all(out_dir)?;
    let out_path = out_dir.join(out_name);
    let mut out = BufWriter::new(File::create(&out_path)?);

    let progress = ProgressBar::new(stream_length);
    progress.set_style(
        ProgressStyle::with_template("  + DUMPING {msg}: {bytes}/{total_bytes} {bar:30}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress.set_message(out_name.to_string());

    let mut buffer = vec![0u8; DUMP_CHUNK];
    loop {
        let read = value.read(&mut fs, &mut buffer)?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])?;
        progress.inc(read as u64);
    }
    out.flush()?;
    progress.finish_and_clear();

    tracing::info!(
        "dumped inode {} stream {:?} ({} bytes) to {}",
        inode,
        stream_name,
        stream_length,
        out_path.display()
    );
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn classify_standalone_mft() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"FILE0\x00\x03\x00").unwrap();
        assert_eq!(classify(file.path(), 0).unwrap(), Evidence::Mft);
    }

    #[test]
    fn classify_raw_ntfs_at_offset() {
        let mut image = vec![0u8; 2048];
        image[1024 + 3..1024 + 7].copy_from_slice(b"NTFS");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        assert_eq!(classify(file.path(), 1024).unwrap(), Evidence::Ntfs);
        assert_eq!(classify(file.path(), 0).unwrap(), Evidence::Unsupported);
    }

    #[test]
    fn classify_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not an artifact").unwrap();
        assert_eq!(classify(file.path(), 0).unwrap(), Evidence::Unsupported);
    }

    #[test]
    fn offset_reader_rebases_positions() {
        let data: Vec<u8> = (0u8..64).collect();
        let mut reader = OffsetReader::new(Cursor::new(data), 16).unwrap();

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [16, 17, 18, 19]);

        reader.seek(SeekFrom::Start(0)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [16, 17, 18, 19]);

        let pos = reader.seek(SeekFrom::Current(4)).unwrap();
        assert_eq!(pos, 8);
    }
}
