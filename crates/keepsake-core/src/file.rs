//! Byte backends an [`Archive`](crate::archive::Archive) reads from or
//! writes to.
//!
//! | backend               | format    | lives in | persistent |
//! |-----------------------|-----------|----------|------------|
//! | [`MemoryFile`]        | plain     | memory   | no         |
//! | [`PlainFile`]         | plain     | disk     | yes        |
//! | [`CompressedFile`]    | container | disk     | yes        |
//! | [`CompressedMemFile`] | container | memory   | no         |
//!
//! Every backend works on an in-memory buffer. Disk backends load the whole
//! file when opened for reading and write it out when closed after writing;
//! container backends implode on close and explode on open.

use std::fs::File;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::container::{self, ContainerHeader, CONTAINER_SIGNATURE, HEADER_LEN};
use crate::{ArchiveError, ArchiveResult};

// ---------------------------------------------------------------------------
// ArchiveFile
// ---------------------------------------------------------------------------

/// Direction a backend was opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpenMode {
    Read,
    Write,
}

/// Byte source or sink used by an archive.
///
/// Calling `read` on a backend opened for writing (or `write` on one opened
/// for reading), or using a closed backend, is a contract violation and
/// panics.
pub trait ArchiveFile {
    /// Direction this backend was last opened in.
    fn mode(&self) -> OpenMode;

    fn is_open(&self) -> bool;

    /// Whether the data outlives the process.
    fn is_persistent(&self) -> bool;

    /// Copy up to `buf.len()` bytes from the current position. Returns the
    /// number copied, which is short only at the end of the data.
    fn read(&mut self, buf: &mut [u8]) -> ArchiveResult<usize>;

    /// Write `buf` at the current position, growing the data as needed.
    fn write(&mut self, buf: &[u8]) -> ArchiveResult<()>;

    /// Current position.
    fn tell(&self) -> u64;

    /// Move the position. The target is clamped to `0..=length`; returns the
    /// new position.
    fn seek(&mut self, pos: SeekFrom) -> u64;

    /// Length of the readable or written data.
    fn length(&self) -> u64;

    /// Finish the session. Writers flush (and implode) here.
    fn close(&mut self) -> ArchiveResult<()>;
}

// ---------------------------------------------------------------------------
// Cursor shared by every backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Cursor {
    data: Vec<u8>,
    pos: usize,
    mode: OpenMode,
    open: bool,
}

impl Cursor {
    fn reading(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            mode: OpenMode::Read,
            open: true,
        }
    }

    fn writing() -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
            mode: OpenMode::Write,
            open: true,
        }
    }

    fn require(&self, mode: OpenMode, op: &str) {
        assert!(self.open, "{op} on a closed file");
        assert!(
            self.mode == mode,
            "{op} on a file opened for {:?}",
            self.mode
        );
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.require(OpenMode::Read, "read");
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn write(&mut self, bytes: &[u8]) {
        self.require(OpenMode::Write, "write");
        let end = self.pos + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    fn seek(&mut self, pos: SeekFrom) -> u64 {
        assert!(self.open, "seek on a closed file");
        let len = self.data.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => (self.pos as i64).saturating_add(delta),
            SeekFrom::End(delta) => len.saturating_add(delta),
        };
        self.pos = target.clamp(0, len) as usize;
        self.pos as u64
    }

    fn close(&mut self) -> Vec<u8> {
        self.open = false;
        self.pos = 0;
        std::mem::take(&mut self.data)
    }
}

macro_rules! delegate_to_cursor {
    () => {
        fn mode(&self) -> OpenMode {
            self.cursor.mode
        }

        fn is_open(&self) -> bool {
            self.cursor.open
        }

        fn read(&mut self, buf: &mut [u8]) -> ArchiveResult<usize> {
            Ok(self.cursor.read(buf))
        }

        fn write(&mut self, buf: &[u8]) -> ArchiveResult<()> {
            self.cursor.write(buf);
            Ok(())
        }

        fn tell(&self) -> u64 {
            self.cursor.pos as u64
        }

        fn seek(&mut self, pos: SeekFrom) -> u64 {
            self.cursor.seek(pos)
        }

        fn length(&self) -> u64 {
            self.cursor.data.len() as u64
        }
    };
}

// ---------------------------------------------------------------------------
// MemoryFile
// ---------------------------------------------------------------------------

/// Plain bytes in memory.
#[derive(Debug)]
pub struct MemoryFile {
    cursor: Cursor,
    /// Written bytes, kept after close.
    written: Vec<u8>,
}

impl MemoryFile {
    /// An empty file open for writing.
    pub fn writer() -> Self {
        Self {
            cursor: Cursor::writing(),
            written: Vec::new(),
        }
    }

    /// A file open for reading over `bytes`.
    pub fn reader(bytes: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::reading(bytes),
            written: Vec::new(),
        }
    }

    /// The bytes written so far (or, once closed, all bytes written).
    pub fn as_bytes(&self) -> &[u8] {
        if self.cursor.open && self.cursor.mode == OpenMode::Write {
            &self.cursor.data
        } else {
            &self.written
        }
    }

    /// Take the written bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.cursor.open && self.cursor.mode == OpenMode::Write {
            self.cursor.close()
        } else {
            std::mem::take(&mut self.written)
        }
    }
}

impl ArchiveFile for MemoryFile {
    delegate_to_cursor!();

    fn is_persistent(&self) -> bool {
        false
    }

    fn close(&mut self) -> ArchiveResult<()> {
        if !self.cursor.open {
            return Ok(());
        }
        let data = self.cursor.close();
        if self.cursor.mode == OpenMode::Write {
            self.written = data;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PlainFile
// ---------------------------------------------------------------------------

/// Plain bytes on disk.
#[derive(Debug)]
pub struct PlainFile {
    cursor: Cursor,
    path: PathBuf,
    /// Destination handle while writing.
    sink: Option<File>,
}

impl PlainFile {
    /// Load `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        Ok(Self {
            cursor: Cursor::reading(data),
            path,
            sink: None,
        })
    }

    /// Create (or truncate) `path` for writing. The data is written on close.
    pub fn create(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let sink = File::create(&path)?;
        Ok(Self {
            cursor: Cursor::writing(),
            path,
            sink: Some(sink),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArchiveFile for PlainFile {
    delegate_to_cursor!();

    fn is_persistent(&self) -> bool {
        true
    }

    fn close(&mut self) -> ArchiveResult<()> {
        if !self.cursor.open {
            return Ok(());
        }
        let data = self.cursor.close();
        if let Some(mut sink) = self.sink.take() {
            sink.write_all(&data)?;
            sink.flush()?;
            tracing::debug!(path = %self.path.display(), bytes = data.len(), "wrote plain file");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CompressedFile
// ---------------------------------------------------------------------------

/// A container on disk.
#[derive(Debug)]
pub struct CompressedFile {
    cursor: Cursor,
    path: PathBuf,
    sink: Option<File>,
    compress: bool,
}

impl CompressedFile {
    /// Load and explode the container at `path`.
    pub fn open(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path)?;
        let data = container::explode(&bytes)?;
        Ok(Self {
            cursor: Cursor::reading(data),
            path,
            sink: None,
            compress: true,
        })
    }

    /// Create (or truncate) `path`. The container is written on close.
    pub fn create(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let sink = File::create(&path)?;
        Ok(Self {
            cursor: Cursor::writing(),
            path,
            sink: Some(sink),
            compress: true,
        })
    }

    /// Store the payload verbatim instead of deflating it.
    pub fn set_compress(&mut self, compress: bool) {
        self.compress = compress;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArchiveFile for CompressedFile {
    delegate_to_cursor!();

    fn is_persistent(&self) -> bool {
        true
    }

    fn close(&mut self) -> ArchiveResult<()> {
        if !self.cursor.open {
            return Ok(());
        }
        let data = self.cursor.close();
        if let Some(mut sink) = self.sink.take() {
            let bytes = container::implode(&data, self.compress);
            sink.write_all(&bytes)?;
            sink.flush()?;
            tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "wrote container file");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CompressedMemFile
// ---------------------------------------------------------------------------

/// A container held in memory.
///
/// Closing after writing implodes the data and keeps the container. The same
/// value can then be [`reopen`](Self::reopen)ed for reading any number of
/// times, handed out as raw bytes, or embedded in another archive with
/// [`serialize`](Self::serialize).
#[derive(Debug)]
pub struct CompressedMemFile {
    cursor: Cursor,
    container: Option<Vec<u8>>,
    compress: bool,
}

impl CompressedMemFile {
    /// An empty file open for writing.
    pub fn new() -> Self {
        Self {
            cursor: Cursor::writing(),
            container: None,
            compress: true,
        }
    }

    /// Wrap existing container bytes. The result is closed; call
    /// [`reopen`](Self::reopen) to read it.
    ///
    /// Only the header is validated here; the payload is checked when the
    /// file is reopened.
    pub fn from_container(bytes: Vec<u8>) -> ArchiveResult<Self> {
        let header = ContainerHeader::parse(&bytes)?;
        if bytes.len() < HEADER_LEN + header.payload_len() {
            return Err(ArchiveError::Truncated {
                needed: HEADER_LEN + header.payload_len(),
                available: bytes.len(),
            });
        }
        let mut cursor = Cursor::writing();
        cursor.close();
        Ok(Self {
            cursor,
            container: Some(bytes),
            compress: true,
        })
    }

    /// Store the payload verbatim instead of deflating it.
    pub fn set_compress(&mut self, compress: bool) {
        self.compress = compress;
    }

    /// Discard any read state and start reading the held container from the
    /// beginning.
    ///
    /// # Panics
    ///
    /// Panics while the file is still open for writing, or if it never held
    /// a container.
    pub fn reopen(&mut self) -> ArchiveResult<()> {
        assert!(
            !(self.cursor.open && self.cursor.mode == OpenMode::Write),
            "close a compressed memory file before reopening it"
        );
        let container = self
            .container
            .as_deref()
            .unwrap_or_else(|| panic!("compressed memory file holds no container to reopen"));
        let data = container::explode(container)?;
        self.cursor = Cursor::reading(data);
        Ok(())
    }

    /// Size of the held container in bytes, 0 before the first close.
    pub fn container_len(&self) -> usize {
        self.container.as_ref().map_or(0, Vec::len)
    }

    /// The held container, if the file has been closed after writing.
    pub fn container_bytes(&self) -> Option<&[u8]> {
        self.container.as_deref()
    }

    /// Copy the container into `out`. Returns the number of bytes copied,
    /// which is less than [`container_len`](Self::container_len) when `out`
    /// is too small.
    pub fn write_to_buffer(&self, out: &mut [u8]) -> usize {
        let Some(container) = self.container.as_deref() else {
            return 0;
        };
        let n = container.len().min(out.len());
        out[..n].copy_from_slice(&container[..n]);
        n
    }

    /// Take the container bytes.
    pub fn into_container(self) -> Option<Vec<u8>> {
        self.container
    }

    /// Embed this container in another archive, or read one from it.
    ///
    /// Storing closes the file first if it is still being written. The
    /// container is written as its header fields followed by the payload.
    /// Loading replaces the held container and leaves the file closed.
    pub fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            if self.cursor.open && self.cursor.mode == OpenMode::Write {
                self.close()?;
            }
            let container = self.container.as_deref().unwrap_or_else(|| {
                panic!("compressed memory file holds no container to store")
            });
            let header = ContainerHeader::parse(container)?;
            arc.write_bytes(&CONTAINER_SIGNATURE)?;
            arc.write_u32(header.compressed_len)?;
            arc.write_u32(header.uncompressed_len)?;
            arc.write_bytes(&container[HEADER_LEN..HEADER_LEN + header.payload_len()])
        } else {
            let mut found = [0u8; 4];
            arc.read_bytes(&mut found)?;
            if found != CONTAINER_SIGNATURE {
                return arc.fail(ArchiveError::BadSignature {
                    expected: CONTAINER_SIGNATURE,
                    found,
                });
            }
            let header = ContainerHeader {
                compressed_len: arc.read_u32()?,
                uncompressed_len: arc.read_u32()?,
            };
            let payload = arc.read_byte_vec(header.payload_len())?;

            let mut container = Vec::with_capacity(HEADER_LEN + payload.len());
            container.extend_from_slice(&header.to_bytes());
            container.extend_from_slice(&payload);
            self.cursor.close();
            self.container = Some(container);
            Ok(())
        }
    }
}

impl Default for CompressedMemFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveFile for CompressedMemFile {
    delegate_to_cursor!();

    fn is_persistent(&self) -> bool {
        false
    }

    fn close(&mut self) -> ArchiveResult<()> {
        if !self.cursor.open {
            return Ok(());
        }
        let data = self.cursor.close();
        if self.cursor.mode == OpenMode::Write {
            self.container = Some(container::implode(&data, self.compress));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
