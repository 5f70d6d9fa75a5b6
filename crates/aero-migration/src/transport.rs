use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::sync::{Mutex, PoisonError};

/// Which way bytes flow through a stream. Fixed for the stream's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte sink/source underneath a [`crate::MigrationStream`].
///
/// Methods take `&self` because buffered streams write from worker threads while the
/// producer keeps running; implementations provide their own interior locking.
///
/// `pos` is the stream offset of the first byte. Positional transports (files) must
/// honour it: in buffered mode several writes can be in flight and may complete out
/// of order. Sequential transports (sockets, pipes) can ignore it, but must then
/// report `supports_buffered_mode() == false`.
pub trait Transport: Send + Sync {
    /// Reads at most `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&self, buf: &mut [u8], pos: u64) -> io::Result<usize>;

    /// Issues one vectored write and returns how many bytes were accepted.
    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], pos: u64) -> io::Result<usize>;

    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Queried exactly once, when a stream is opened.
    fn supports_buffered_mode(&self) -> bool {
        false
    }
}

/// Positional in-memory transport. Useful for tests and for staging a snapshot in RAM.
#[derive(Debug, Default)]
pub struct MemTransport {
    data: Mutex<Vec<u8>>,
    buffered: bool,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            buffered: false,
        }
    }

    /// Advertise buffered-mode support so writers use the background pool.
    pub fn buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for MemTransport {
    fn read(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = usize::try_from(pos).map_err(|_| io::ErrorKind::InvalidInput)?;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], pos: u64) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut offset = usize::try_from(pos).map_err(|_| io::ErrorKind::InvalidInput)?;
        let mut written = 0;
        for buf in bufs {
            let end = offset
                .checked_add(buf.len())
                .ok_or(io::ErrorKind::InvalidInput)?;
            if end > data.len() {
                data.resize(end, 0);
            }
            data[offset..end].copy_from_slice(buf);
            offset = end;
            written += buf.len();
        }
        Ok(written)
    }

    fn supports_buffered_mode(&self) -> bool {
        self.buffered
    }
}

/// Adapter for sequential byte pipes (sockets, pipes, stdio). Offsets are ignored,
/// so this transport never offers buffered mode.
pub struct IoTransport<T> {
    inner: Mutex<T>,
}

impl<T> IoTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Read + Write + Send> Transport for IoTransport<T> {
    fn read(&self, buf: &mut [u8], _pos: u64) -> io::Result<usize> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(buf)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], _pos: u64) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut written = 0;
        for buf in bufs {
            inner.write_all(buf)?;
            written += buf.len();
        }
        inner.flush()?;
        Ok(written)
    }
}

/// Positional file transport; supports buffered mode.
#[cfg(unix)]
#[derive(Debug)]
pub struct FileTransport {
    file: std::fs::File,
}

#[cfg(unix)]
impl FileTransport {
    pub fn new(file: std::fs::File) -> Self {
        Self { file }
    }

    pub fn into_inner(self) -> std::fs::File {
        self.file
    }
}

#[cfg(unix)]
impl Transport for FileTransport {
    fn read(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, pos)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], pos: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut offset = pos;
        for buf in bufs {
            self.file.write_all_at(buf, offset)?;
            offset += buf.len() as u64;
        }
        Ok((offset - pos) as usize)
    }

    fn close(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn supports_buffered_mode(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_transport_writes_at_offsets() {
        let t = MemTransport::new();
        assert_eq!(t.write_vectored_at(&[IoSlice::new(b"cd")], 2).unwrap(), 2);
        assert_eq!(
            t.write_vectored_at(&[IoSlice::new(b"a"), IoSlice::new(b"b")], 0)
                .unwrap(),
            2
        );
        assert_eq!(t.contents(), b"abcd");

        let mut buf = [0u8; 8];
        assert_eq!(t.read(&mut buf, 1).unwrap(), 3);
        assert_eq!(&buf[..3], b"bcd");
        assert_eq!(t.read(&mut buf, 4).unwrap(), 0);
    }

    #[test]
    fn io_transport_ignores_offsets() {
        let t = IoTransport::new(std::io::Cursor::new(Vec::new()));
        t.write_vectored_at(&[IoSlice::new(b"xy")], 100).unwrap();
        t.write_vectored_at(&[IoSlice::new(b"z")], 0).unwrap();
        assert!(!t.supports_buffered_mode());
        assert_eq!(t.into_inner().into_inner(), b"xyz");
    }

    #[cfg(unix)]
    #[test]
    fn file_transport_round_trips() {
        let path = std::env::temp_dir().join(format!(
            "aero-migration-file-transport-{}",
            std::process::id()
        ));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let t = FileTransport::new(file);
        assert!(t.supports_buffered_mode());
        t.write_vectored_at(&[IoSlice::new(b"world")], 6).unwrap();
        t.write_vectored_at(&[IoSlice::new(b"hello ")], 0).unwrap();
        t.close().unwrap();

        let mut buf = [0u8; 11];
        assert_eq!(t.read(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        drop(t);
        std::fs::remove_file(&path).unwrap();
    }
}
