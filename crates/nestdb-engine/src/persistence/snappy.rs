//! Snappy-framed persistence driver.
//!
//! Frame format: `[u32 little-endian compressed length][snappy block]`,
//! repeated. Each `write_all` call becomes one frame, so a command written
//! in one call decompresses in one piece. A truncated trailing frame reads
//! as clean EOF.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use nestdb_common::{NestError, Result};

use super::file::WRITE_BUFFER_SIZE;
use super::{Driver, LogWriter, Store};

/// Block-compressed append-only storage.
pub struct SnappyDriver;

struct SnappyStore {
    path: PathBuf,
}

struct SnappyWriter {
    buffer: BufWriter<File>,
    encoder: snap::raw::Encoder,
}

struct SnappyReader {
    file: File,
    buffer: Vec<u8>,
    offset: usize,
}

impl Driver for SnappyDriver {
    fn open(&self, path: &Path) -> Result<Box<dyn Store>> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(NestError::read_failed)?;
        Ok(Box::new(SnappyStore {
            path: path.to_path_buf(),
        }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(NestError::write_failed)
    }
}

impl Store for SnappyStore {
    fn reader(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(NestError::read_failed)?;
        Ok(Box::new(SnappyReader {
            file,
            buffer: Vec::new(),
            offset: 0,
        }))
    }

    fn append_writer(&self) -> Result<Box<dyn LogWriter>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(NestError::write_failed)?;
        Ok(Box::new(SnappyWriter {
            buffer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            encoder: snap::raw::Encoder::new(),
        }))
    }
}

impl LogWriter for SnappyWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let encoded = self
            .encoder
            .compress_vec(buf)
            .map_err(NestError::write_failed)?;
        let header = (encoded.len() as u32).to_le_bytes();
        self.buffer
            .write_all(&header)
            .map_err(NestError::write_failed)?;
        self.buffer
            .write_all(&encoded)
            .map_err(NestError::write_failed)
    }

    fn flush(&mut self) -> Result<()> {
        self.buffer.flush().map_err(NestError::write_failed)
    }
}

impl SnappyReader {
    /// Read the next frame into the internal buffer. Returns false on EOF,
    /// including a frame cut short by truncation.
    fn fill(&mut self) -> std::io::Result<bool> {
        loop {
            let mut header = [0u8; 4];
            if !read_full(&mut self.file, &mut header)? {
                return Ok(false);
            }
            let length = u32::from_le_bytes(header) as usize;
            if length == 0 {
                continue;
            }
            let mut compressed = vec![0u8; length];
            if !read_full(&mut self.file, &mut compressed)? {
                return Ok(false);
            }
            let decoded = snap::raw::Decoder::new()
                .decompress_vec(&compressed)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            self.buffer = decoded;
            self.offset = 0;
            return Ok(true);
        }
    }
}

impl Read for SnappyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.offset < self.buffer.len() {
                let n = buf.len().min(self.buffer.len() - self.offset);
                buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            if !self.fill()? {
                return Ok(0);
            }
        }
    }
}

/// Fill `buf` completely, or report false if EOF arrives first (partial
/// reads are treated as end of data, not an error).
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.snappy");

        let store = SnappyDriver.open(&path).unwrap();
        let mut writer = store.append_writer().unwrap();
        writer.write_all(b"{\"name\":\"insert\"}\n").unwrap();
        writer.write_all(b"{\"name\":\"remove\"}\n").unwrap();
        writer.flush().unwrap();

        let mut content = String::new();
        store.reader().unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "{\"name\":\"insert\"}\n{\"name\":\"remove\"}\n");
    }

    #[test]
    fn test_file_is_compressed_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.snappy");

        let payload = "a".repeat(4096);
        let store = SnappyDriver.open(&path).unwrap();
        let mut writer = store.append_writer().unwrap();
        writer.write_all(payload.as_bytes()).unwrap();
        writer.flush().unwrap();

        let raw = std::fs::read(&path).unwrap();
        let frame_len = u32::from_le_bytes(raw[..4].try_into().unwrap()) as usize;
        assert_eq!(raw.len(), 4 + frame_len);
        assert!(frame_len < payload.len());
    }

    #[test]
    fn test_truncated_frame_reads_as_clean_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.snappy");

        let store = SnappyDriver.open(&path).unwrap();
        let mut writer = store.append_writer().unwrap();
        writer.write_all(b"first frame payload").unwrap();
        writer.write_all(b"second frame payload").unwrap();
        writer.flush().unwrap();
        drop(writer);

        // Chop the file mid-way through the second frame.
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 5]).unwrap();

        let mut content = String::new();
        store.reader().unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "first frame payload");
    }

    #[test]
    fn test_appends_across_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.snappy");

        {
            let store = SnappyDriver.open(&path).unwrap();
            let mut writer = store.append_writer().unwrap();
            writer.write_all(b"one\n").unwrap();
            writer.flush().unwrap();
        }
        {
            let store = SnappyDriver.open(&path).unwrap();
            let mut writer = store.append_writer().unwrap();
            writer.write_all(b"two\n").unwrap();
            writer.flush().unwrap();
        }

        let store = SnappyDriver.open(&path).unwrap();
        let mut content = String::new();
        store.reader().unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }
}
