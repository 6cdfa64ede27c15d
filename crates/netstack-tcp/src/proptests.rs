//! Round-trip property tests for the wire codec: anything `wire::build` writes, `wire::parse`
//! must read back unchanged, for arbitrary seq/ack/flags/options/payload combinations. Kept in
//! a separate module, gated behind the `proptest` feature and only compiled for `test`, so the
//! default build and the always-on unit tests stay free of the extra dependency.

use std::net::Ipv4Addr;

use proptest::prelude::*;

use crate::wire::{self, BuildFlags, SegmentOptions};

fn build_flags() -> impl Strategy<Value = BuildFlags> {
    any::<(bool, bool, bool, bool, bool)>()
        .prop_map(|(syn, fin, rst, ack, psh)| BuildFlags { syn, fin, rst, ack, psh })
}

fn segment_options() -> impl Strategy<Value = SegmentOptions> {
    (
        proptest::option::of(any::<u16>()),
        proptest::option::of(0u8..15u8),
        proptest::option::of(any::<(u32, u32)>()),
    )
        .prop_map(|(mss, window_scale, timestamp)| SegmentOptions { mss, window_scale, timestamp })
}

#[test_strategy::proptest()]
fn build_then_parse_round_trips_header_fields(
    #[strategy(any::<u32>())] seq: u32,
    #[strategy(any::<u32>())] ack: u32,
    #[strategy(any::<u16>())] window_size: u16,
    #[strategy(build_flags())] flags: BuildFlags,
    #[strategy(segment_options())] opts: SegmentOptions,
    #[strategy(proptest::collection::vec(any::<u8>(), 0..64))] payload: Vec<u8>,
) {
    let src = Ipv4Addr::new(10, 0, 0, 1);
    let dst = Ipv4Addr::new(10, 0, 0, 2);
    let bytes = wire::build(src, dst, 1000, 2000, seq, ack, window_size, flags, opts, &payload)
        .expect("arbitrary in-range fields always build a valid segment");

    let parsed = wire::parse(src, dst, &bytes).expect("a just-built segment always parses");

    prop_assert_eq!(parsed.source_port, 1000);
    prop_assert_eq!(parsed.destination_port, 2000);
    prop_assert_eq!(parsed.seq, seq);
    prop_assert_eq!(parsed.ack, ack);
    prop_assert_eq!(parsed.syn, flags.syn);
    prop_assert_eq!(parsed.fin, flags.fin);
    prop_assert_eq!(parsed.rst, flags.rst);
    prop_assert_eq!(parsed.ack_flag, flags.ack);
    prop_assert_eq!(parsed.psh, flags.psh);
    prop_assert_eq!(parsed.window_size, window_size);
    prop_assert_eq!(parsed.mss, opts.mss);
    prop_assert_eq!(parsed.window_scale, opts.window_scale);
    prop_assert_eq!(parsed.timestamp, opts.timestamp);
    prop_assert_eq!(parsed.payload, payload.as_slice());
    prop_assert!(parsed.checksum_ok_against.is_some(), "a freshly built segment always checksums clean");
}

#[test_strategy::proptest()]
fn parse_rejects_buffers_shorter_than_a_minimal_header(#[strategy(0usize..20)] len: usize) {
    // Any buffer shorter than the fixed 20-byte TCP header is rejected regardless of content.
    let garbage = vec![0u8; len];
    prop_assert!(wire::parse(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), &garbage).is_err());
}
