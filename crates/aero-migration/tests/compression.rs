#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;

use aero_migration::{
    Direction, MemTransport, MigrationError, MigrationStream, StreamConfig, CHUNK_PREFIX_LEN,
};

fn compressed(buffer_size: usize) -> StreamConfig {
    StreamConfig::default()
        .with_buffer_size(buffer_size)
        .with_alignment(8)
        .with_compression(6)
}

#[test]
fn compressed_chunks_round_trip_between_plain_data() {
    let t = Arc::new(MemTransport::new());
    let mut w = MigrationStream::open(t.clone(), Direction::Write, compressed(256)).unwrap();
    w.put_be32(0x1111_1111);
    let n = w.put_compressed(b"AAAAAAAAAA").unwrap();
    assert!(n < CHUNK_PREFIX_LEN + 10, "chunk took {n} bytes");
    assert_eq!(w.tell(), 4 + n as u64);

    let page: Vec<u8> = (0..200u32).map(|i| (i % 7) as u8).collect();
    w.put_compressed(&page).unwrap();
    w.put_be32(0x2222_2222);
    w.close().unwrap();

    let mut r = MigrationStream::open(
        Arc::new(MemTransport::from_bytes(t.contents())),
        Direction::Read,
        StreamConfig::default().with_buffer_size(256).with_alignment(8),
    )
    .unwrap();
    assert_eq!(r.get_be32(), 0x1111_1111);
    let mut out = [0u8; 256];
    assert_eq!(r.get_compressed(&mut out).unwrap(), 10);
    assert_eq!(&out[..10], b"AAAAAAAAAA");
    assert_eq!(r.get_compressed(&mut out).unwrap(), 200);
    assert_eq!(&out[..200], page.as_slice());
    assert_eq!(r.get_be32(), 0x2222_2222);
}

#[test]
fn chunk_that_cannot_fit_any_buffer_is_recoverable() {
    let t = Arc::new(MemTransport::new());
    let mut w = MigrationStream::open(t, Direction::Write, compressed(16)).unwrap();
    let err = w.put_compressed(b"AAAAAAAAAA").unwrap_err();
    assert!(matches!(
        err,
        MigrationError::WouldNotFit {
            needed: 27,
            available: 16
        }
    ));
    assert!(w.last_error().is_none());
    w.put_bytes(b"AAAAAAAAAA");
    w.close().unwrap();
}

#[test]
fn full_scratch_is_flushed_before_compressing() {
    let t = Arc::new(MemTransport::new());
    let mut w = MigrationStream::open(t.clone(), Direction::Write, compressed(64)).unwrap();
    w.put_bytes(&[1u8; 50]);
    // Needs 27 bytes, only 14 left: the 50 pending bytes go out first.
    let n = w.put_compressed(b"AAAAAAAAAA").unwrap();
    assert_eq!(t.len(), 50);
    assert_eq!(w.unflushed(), n);
    w.close().unwrap();
    assert_eq!(t.len(), 50 + n);
}

#[test]
fn compression_requires_a_vectored_writer() {
    let buffered = Arc::new(MemTransport::new().buffered(true));
    let err = MigrationStream::open(buffered, Direction::Write, compressed(64)).unwrap_err();
    assert!(matches!(err, MigrationError::UnsupportedMode { .. }));

    let source = Arc::new(MemTransport::new());
    let err = MigrationStream::open(source, Direction::Read, compressed(64)).unwrap_err();
    assert!(matches!(err, MigrationError::InvalidConfig(_)));
}

#[test]
fn put_compressed_without_compression_is_rejected() {
    let t = Arc::new(MemTransport::new());
    let mut w = MigrationStream::open(
        t,
        Direction::Write,
        StreamConfig::default().with_buffer_size(64).with_alignment(8),
    )
    .unwrap();
    assert!(matches!(
        w.put_compressed(b"data"),
        Err(MigrationError::InvalidConfig(_))
    ));
    assert!(w.last_error().is_none());
}

#[test]
fn oversized_chunk_header_is_fatal_on_read() {
    let mut data = 1024u32.to_be_bytes().to_vec();
    data.extend_from_slice(&[0; 16]);
    let mut r = MigrationStream::open(
        Arc::new(MemTransport::from_bytes(data)),
        Direction::Read,
        StreamConfig::default().with_buffer_size(64).with_alignment(8),
    )
    .unwrap();
    let mut out = [0u8; 64];
    assert!(matches!(
        r.get_compressed(&mut out),
        Err(MigrationError::Compression(_))
    ));
    assert!(r.last_error().is_some());
}

#[test]
fn truncated_chunk_is_reported() {
    let mut data = 8u32.to_be_bytes().to_vec();
    data.extend_from_slice(&[0; 3]);
    let mut r = MigrationStream::open(
        Arc::new(MemTransport::from_bytes(data)),
        Direction::Read,
        StreamConfig::default().with_buffer_size(64).with_alignment(8),
    )
    .unwrap();
    let mut out = [0u8; 64];
    assert!(matches!(
        r.get_compressed(&mut out),
        Err(MigrationError::Compression(_))
    ));
}
