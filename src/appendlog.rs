//! Persistent single-value store backed by an append-only file.
//!
//! Layout, all big-endian: a 2-byte file format version, then three 8-byte
//! fields (offset of the current value within the data region, one past its
//! end, and the logical state version), then the data region. Every put
//! appends the new value and rewrites the header to point at it; superseded
//! bytes stay in the file unreferenced. There is no compaction.
//!
//! The header is the commit point. A crash after the data append but before
//! the header rewrite leaves trailing bytes that the next put simply
//! overwrites. A crash mid-rewrite can tear the header; `open` catches the
//! inconsistencies its range checks can see, and callers that need atomicity
//! beyond that must layer it themselves.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs_err::os::unix::fs::OpenOptionsExt;
use fs_err::{File, OpenOptions};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Datastore;

const FILE_VERSION: u16 = 1;

const FILE_VERSION_POS: u64 = 0;
const OFFSET_POS: u64 = 2;
const NEXT_OFFSET_POS: u64 = 10;
const VERSION_POS: u64 = 18;
const HEADER_LEN: u64 = 26;

pub struct AppendLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    file: Option<File>,
    offset: u64,
    next_offset: u64,
}

impl AppendLog {
    /// Create a handle for the log at `path`. The file is not touched until
    /// [`Datastore::open`] is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner {
                file: None,
                offset: 0,
                next_offset: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("append log lock poisoned")
    }
}

impl Datastore for AppendLog {
    /// Open the file, creating it if absent, and validate the header of an
    /// existing one. Opening an already-open log is a no-op.
    fn open(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.file.is_some() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&self.path)?;
        let size = file.metadata()?.len();

        // A fresh file has no header yet; the first put writes one.
        if size == 0 {
            inner.file = Some(file);
            inner.offset = 0;
            inner.next_offset = 0;
            return Ok(());
        }

        let file_version = read_header_u16(&mut file, FILE_VERSION_POS)?;
        if file_version != FILE_VERSION {
            return Err(Error::UnexpectedFileVersion);
        }

        let offset = read_header_u64(&mut file, OFFSET_POS)?;
        let next_offset = read_header_u64(&mut file, NEXT_OFFSET_POS)?;

        if offset > next_offset {
            return Err(Error::NextOffsetOutOfRange);
        }
        if offset > size {
            return Err(Error::OffsetOutOfRange);
        }

        debug!(path = %self.path.display(), offset, next_offset, "opened append log");
        inner.file = Some(file);
        inner.offset = offset;
        inner.next_offset = next_offset;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // Dropping the handle closes it. Close is idempotent.
        self.lock().file.take();
        Ok(())
    }

    fn get(&self) -> Result<(u64, Vec<u8>)> {
        let mut inner = self.lock();
        let (offset, next_offset) = (inner.offset, inner.next_offset);
        let file = inner.file.as_mut().ok_or(Error::FileNotOpen)?;

        let version = read_header_u64(file, VERSION_POS)?;

        let mut data = vec![0u8; (next_offset - offset) as usize];
        file.seek(SeekFrom::Start(HEADER_LEN + offset))?;
        file.read_exact(&mut data)?;

        Ok((version, data))
    }

    fn put(&self, version: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let file = inner.file.as_mut().ok_or(Error::FileNotOpen)?;

        file.seek(SeekFrom::Start(HEADER_LEN + inner.next_offset))?;
        file.write_all(data)?;

        inner.offset = inner.next_offset;
        inner.next_offset += data.len() as u64;

        let mut header = [0u8; HEADER_LEN as usize];
        header[0..2].copy_from_slice(&FILE_VERSION.to_be_bytes());
        header[2..10].copy_from_slice(&inner.offset.to_be_bytes());
        header[10..18].copy_from_slice(&inner.next_offset.to_be_bytes());
        header[18..26].copy_from_slice(&version.to_be_bytes());

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        Ok(())
    }
}

// Header fields read as zero when the file ends before them, matching how an
// interrupted first put looks to a fresh open.
fn read_header_u16(file: &mut File, pos: u64) -> Result<u16> {
    let mut buf = [0u8; 2];
    file.seek(SeekFrom::Start(pos))?;
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(u16::from_be_bytes(buf)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn read_header_u64(file: &mut File, pos: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(pos))?;
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(u64::from_be_bytes(buf)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(err) => Err(err.into()),
    }
}
