//! Raw file persistence driver.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use nestdb_common::{NestError, Result};

use super::{Driver, LogWriter, Store};

/// Writer buffer size. Large enough that bursts of small commands coalesce
/// into few syscalls.
pub(crate) const WRITE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Plain append-only file storage, one log file per collection.
pub struct FileDriver;

struct FileStore {
    path: PathBuf,
}

struct FileWriter {
    buffer: BufWriter<File>,
}

impl Driver for FileDriver {
    fn open(&self, path: &Path) -> Result<Box<dyn Store>> {
        // Ensure the file exists before readers or writers open it.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(NestError::read_failed)?;
        Ok(Box::new(FileStore {
            path: path.to_path_buf(),
        }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(NestError::write_failed)
    }
}

impl Store for FileStore {
    fn reader(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(NestError::read_failed)?;
        Ok(Box::new(file))
    }

    fn append_writer(&self) -> Result<Box<dyn LogWriter>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(NestError::write_failed)?;
        Ok(Box::new(FileWriter {
            buffer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
        }))
    }
}

impl LogWriter for FileWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buffer.write_all(buf).map_err(NestError::write_failed)
    }

    fn flush(&mut self) -> Result<()> {
        self.buffer.flush().map_err(NestError::write_failed)
    }
}
