#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;

use aero_migration::{Direction, MemTransport, MigrationStream, StreamConfig};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Bytes(Vec<u8>),
    Borrowed(Vec<u8>),
    Byte(u8),
    Be16(u16),
    Be32(u32),
    Be64(u64),
    Flush,
}

const MAX_OPS: usize = 48;
const MAX_CHUNK: usize = 700;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => proptest::collection::vec(any::<u8>(), 0..MAX_CHUNK).prop_map(Op::Bytes),
        2 => proptest::collection::vec(any::<u8>(), 0..MAX_CHUNK).prop_map(Op::Borrowed),
        1 => any::<u8>().prop_map(Op::Byte),
        1 => any::<u16>().prop_map(Op::Be16),
        1 => any::<u32>().prop_map(Op::Be32),
        1 => any::<u64>().prop_map(Op::Be64),
        1 => Just(Op::Flush),
    ]
}

fn config_strategy() -> impl Strategy<Value = StreamConfig> {
    (
        prop_oneof![Just(16usize), Just(64usize), Just(512usize)],
        1usize..=3,
        prop_oneof![Just(1usize), Just(2usize), Just(64usize)],
    )
        .prop_map(|(size, count, max_iov)| {
            StreamConfig::default()
                .with_buffer_size(size)
                .with_alignment(8)
                .with_buffer_count(count)
                .with_max_iov(max_iov)
        })
}

fn expected_bytes(ops: &[Op]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        match op {
            Op::Bytes(data) | Op::Borrowed(data) => out.extend_from_slice(data),
            Op::Byte(v) => out.push(*v),
            Op::Be16(v) => out.extend_from_slice(&v.to_be_bytes()),
            Op::Be32(v) => out.extend_from_slice(&v.to_be_bytes()),
            Op::Be64(v) => out.extend_from_slice(&v.to_be_bytes()),
            Op::Flush => {}
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn written_stream_reads_back_identically(
        ops in proptest::collection::vec(op_strategy(), 0..MAX_OPS),
        config in config_strategy(),
        buffered in any::<bool>(),
    ) {
        let expected = expected_bytes(&ops);
        let t = Arc::new(MemTransport::new().buffered(buffered));

        let mut w = MigrationStream::open(t.clone(), Direction::Write, config).unwrap();
        for op in &ops {
            match op {
                Op::Bytes(data) => w.put_bytes(data),
                Op::Borrowed(data) => w.put_bytes_async(data),
                Op::Byte(v) => w.put_byte(*v),
                Op::Be16(v) => w.put_be16(*v),
                Op::Be32(v) => w.put_be32(*v),
                Op::Be64(v) => w.put_be64(*v),
                Op::Flush => w.flush(),
            }
        }
        prop_assert_eq!(w.tell(), expected.len() as u64);
        w.close().unwrap();
        prop_assert_eq!(t.contents(), expected.clone());

        let mut r = MigrationStream::open(
            Arc::new(MemTransport::from_bytes(expected)),
            Direction::Read,
            config,
        )
        .unwrap();
        for op in &ops {
            match op {
                Op::Bytes(data) | Op::Borrowed(data) => {
                    let mut buf = vec![0u8; data.len()];
                    prop_assert_eq!(r.get_bytes(&mut buf), data.len());
                    prop_assert_eq!(&buf, data);
                }
                Op::Byte(v) => prop_assert_eq!(r.get_byte(), *v),
                Op::Be16(v) => prop_assert_eq!(r.get_be16(), *v),
                Op::Be32(v) => prop_assert_eq!(r.get_be32(), *v),
                Op::Be64(v) => prop_assert_eq!(r.get_be64(), *v),
                Op::Flush => {}
            }
        }
        let mut tail = [0u8; 1];
        prop_assert_eq!(r.get_bytes(&mut tail), 0);
        prop_assert!(r.last_error().is_none());
    }
}
