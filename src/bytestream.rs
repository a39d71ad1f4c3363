use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::Path,
    string::FromUtf16Error,
};

use byteorder::{LittleEndian, ReadBytesExt};

/// Buffered little-endian reader over an on-disk artifact with absolute
/// byte positioning. USN journals are walked with long forward seeks over
/// zero padding, so the stream tracks its own position instead of handing
/// out fixed-size sector buffers.
pub struct ByteStream {
    reader: BufReader<File>,
    size: u64,
}

impl ByteStream {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            size,
        })
    }

    /// Total size of the underlying file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&mut self) -> io::Result<u64> {
        self.reader.stream_position()
    }

    pub fn seek_to(&mut self, offset: u64) -> io::Result<u64> {
        self.reader.seek(SeekFrom::Start(offset))
    }

    /// Moves the position `amount` bytes back and returns the new offset.
    pub fn rewind_by(&mut self, amount: i64) -> io::Result<u64> {
        self.reader.seek(SeekFrom::Current(-amount))
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        self.reader.read_u16::<LittleEndian>()
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        self.reader.read_u32::<LittleEndian>()
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        self.reader.read_u64::<LittleEndian>()
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        self.reader.read_i64::<LittleEndian>()
    }

    pub fn read_raw(&mut self, amount: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; amount];
        self.reader.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Fills as much of `buffer` as the stream still holds and returns the
    /// number of bytes read; 0 means end of file.
    pub fn read_available(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buffer.len() {
            let read = self.reader.read(&mut buffer[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }
}

pub fn interpret_bytes_as_utf16(name_bytes: &[u8]) -> Result<String, FromUtf16Error> {
    let num_bytes = name_bytes.len();
    let mut unicode_symbols: Vec<u16> = Vec::with_capacity(num_bytes / 2);
    for index in (0..num_bytes.saturating_sub(1)).step_by(2) {
        // Order of top and bottom here is reversed since the bytes are in little endian
        let first = name_bytes[index];
        let second = name_bytes[index + 1];
        unicode_symbols.push(((second as u16) << 8) | first as u16);
    }
    String::from_utf16(&unicode_symbols)
}
