#![cfg(not(target_arch = "wasm32"))]

use std::io::{self, IoSlice};
use std::sync::{Arc, Mutex};

use aero_migration::{
    Direction, MemTransport, MigrationError, MigrationStream, StreamConfig, Transport,
};

fn small(buffer_size: usize) -> StreamConfig {
    StreamConfig::default()
        .with_buffer_size(buffer_size)
        .with_alignment(8)
}

fn reader(data: Vec<u8>, buffer_size: usize) -> MigrationStream<'static> {
    MigrationStream::open(
        Arc::new(MemTransport::from_bytes(data)),
        Direction::Read,
        small(buffer_size),
    )
    .unwrap()
}

/// Returns at most `chunk` bytes per read, like a socket under load.
struct TrickleTransport {
    data: Vec<u8>,
    chunk: usize,
    reads: Mutex<usize>,
}

impl Transport for TrickleTransport {
    fn read(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        *self.reads.lock().unwrap() += 1;
        let start = (pos as usize).min(self.data.len());
        let n = buf.len().min(self.chunk).min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn write_vectored_at(&self, _bufs: &[IoSlice<'_>], _pos: u64) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// Fails the first read with `first`, then serves `data`.
struct FlakyTransport {
    first: Mutex<Option<io::ErrorKind>>,
    data: Vec<u8>,
}

impl Transport for FlakyTransport {
    fn read(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        if let Some(kind) = self.first.lock().unwrap().take() {
            return Err(kind.into());
        }
        let start = (pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn write_vectored_at(&self, _bufs: &[IoSlice<'_>], _pos: u64) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

#[test]
fn peek_keeps_reading_through_short_reads() {
    let data: Vec<u8> = (0..20u8).collect();
    let t = Arc::new(TrickleTransport {
        data: data.clone(),
        chunk: 3,
        reads: Mutex::new(0),
    });
    let mut s = MigrationStream::open(t.clone(), Direction::Read, small(16)).unwrap();
    assert_eq!(s.peek_bytes(10, 0), &data[..10]);
    assert_eq!(*t.reads.lock().unwrap(), 4);
    assert_eq!(s.tell(), 0);

    let mut out = vec![0u8; 20];
    assert_eq!(s.get_bytes(&mut out), 20);
    assert_eq!(out, data);
    assert_eq!(s.tell(), 20);
}

#[test]
fn end_of_stream_returns_partial_without_error() {
    let mut s = reader(vec![1, 2, 3, 4, 5], 16);
    let mut out = [0u8; 8];
    assert_eq!(s.get_bytes(&mut out), 5);
    assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
    assert!(s.last_error().is_none());
    assert_eq!(s.get_bytes(&mut out), 0);
    assert_eq!(s.get_byte(), 0);
    assert_eq!(s.peek_byte(0), None);
    s.close().unwrap();
}

#[test]
fn peek_window_is_clamped_to_the_buffer() {
    let mut s = reader((0..64u8).collect(), 16);
    assert_eq!(s.peek_bytes(100, 0).len(), 16);
    assert_eq!(s.peek_bytes(8, 12).len(), 4);
    assert!(s.peek_bytes(1, 16).is_empty());
}

#[test]
fn reads_larger_than_the_buffer_are_chunked() {
    let data: Vec<u8> = (0..100u8).collect();
    let mut s = reader(data.clone(), 16);
    let mut out = vec![0u8; 40];
    assert_eq!(s.get_bytes(&mut out), 40);
    assert_eq!(out, &data[..40]);
    s.skip(0);
    assert_eq!(s.get_byte(), 40);
    assert_eq!(s.tell(), 41);
}

#[test]
fn unread_bytes_survive_compaction() {
    let data: Vec<u8> = (0..32u8).collect();
    let mut s = reader(data, 16);
    assert_eq!(s.peek_bytes(16, 0).len(), 16);
    s.skip(10);
    // Needs bytes 10..18: the 6 unread bytes move to the front before refilling.
    assert_eq!(s.peek_bytes(8, 0), &[10, 11, 12, 13, 14, 15, 16, 17]);
    assert_eq!(s.peek_byte(7), Some(17));
}

#[test]
fn in_place_reads_avoid_copies_when_possible() {
    let mut s = reader((0..24u8).collect(), 16);
    assert_eq!(s.get_bytes_in_place(8), Some(&[0, 1, 2, 3, 4, 5, 6, 7][..]));
    assert_eq!(s.tell(), 8);
    assert!(s.get_bytes_in_place(32).is_none());
    assert_eq!(s.tell(), 8);
    // Only 16 bytes remain.
    assert!(s.get_bytes_in_place(16).is_some());
    assert!(s.get_bytes_in_place(1).is_none());
}

#[test]
fn typed_values_are_big_endian() {
    let mut data = vec![0x7f];
    data.extend_from_slice(&0x0102u16.to_be_bytes());
    data.extend_from_slice(&0x0304_0506u32.to_be_bytes());
    data.extend_from_slice(&0x0708_090a_0b0c_0d0eu64.to_be_bytes());
    data.extend_from_slice(b"\x05hello");
    let mut s = reader(data, 8);
    assert_eq!(s.get_byte(), 0x7f);
    assert_eq!(s.get_be16(), 0x0102);
    assert_eq!(s.get_be32(), 0x0304_0506);
    assert_eq!(s.get_be64(), 0x0708_090a_0b0c_0d0e);
    assert_eq!(s.get_counted_string().as_deref(), Some("hello"));
    assert_eq!(s.get_counted_string(), None);
}

#[test]
fn truncated_counted_string_is_none() {
    let mut s = reader(b"\x09abc".to_vec(), 16);
    assert_eq!(s.get_counted_string(), None);
}

#[test]
fn interrupted_reads_are_retried() {
    let t = Arc::new(FlakyTransport {
        first: Mutex::new(Some(io::ErrorKind::Interrupted)),
        data: vec![9, 8, 7],
    });
    let mut s = MigrationStream::open(t, Direction::Read, small(16)).unwrap();
    assert_eq!(s.get_byte(), 9);
    assert!(s.last_error().is_none());
}

#[test]
fn read_failure_is_sticky() {
    let t = Arc::new(FlakyTransport {
        first: Mutex::new(Some(io::ErrorKind::ConnectionReset)),
        data: vec![1, 2, 3],
    });
    let mut s = MigrationStream::open(t, Direction::Read, small(16)).unwrap();
    let mut out = [0u8; 3];
    assert_eq!(s.get_bytes(&mut out), 0);
    match s.last_error() {
        Some(MigrationError::Transport(err)) => {
            assert_eq!(err.kind(), io::ErrorKind::ConnectionReset)
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The transport would succeed now, but the stream stays failed.
    assert_eq!(s.get_bytes(&mut out), 0);
    assert!(s.close().is_err());
}

#[test]
fn reads_on_a_writer_poison_the_stream() {
    let t = Arc::new(MemTransport::new());
    let mut s = MigrationStream::open(t, Direction::Write, small(16)).unwrap();
    assert_eq!(s.get_byte(), 0);
    assert!(matches!(
        s.last_error(),
        Some(MigrationError::WrongDirection { expected: "read" })
    ));
}
