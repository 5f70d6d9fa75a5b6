use std::io::{self, Read, Write};

use crate::error::MigrationError;
use crate::stream::MigrationStream;
use crate::transport::Direction;

fn to_io(err: MigrationError) -> io::Error {
    match &err {
        MigrationError::Transport(inner) => io::Error::new(inner.kind(), err),
        MigrationError::Shutdown => io::Error::new(io::ErrorKind::BrokenPipe, err),
        _ => io::Error::other(err),
    }
}

fn wrong_direction(expected: &'static str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        MigrationError::WrongDirection { expected },
    )
}

/// Lets snapshot encoders that speak `std::io::Write` target a migration stream directly.
impl Write for MigrationStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(err) = self.last_error() {
            return Err(to_io(err));
        }
        if self.direction() != Direction::Write {
            return Err(wrong_direction("write"));
        }
        self.put_bytes(buf);
        match self.last_error() {
            Some(err) => Err(to_io(err)),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        MigrationStream::flush(self);
        match self.last_error() {
            Some(err) => Err(to_io(err)),
            None => Ok(()),
        }
    }
}

impl Read for MigrationStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.last_error() {
            return Err(to_io(err));
        }
        if self.direction() != Direction::Read {
            return Err(wrong_direction("read"));
        }
        let n = self.get_bytes(buf);
        if n == 0 {
            if let Some(err) = self.last_error() {
                return Err(to_io(err));
            }
        }
        Ok(n)
    }
}
