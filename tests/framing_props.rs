//! Chunking must never change how a response is split into header and payload.
#![cfg(feature = "builtins")]

use proptest::prelude::*;
use trickle::{
    framing::{find_terminator, FramingState, HEADER_TERMINATOR},
    transport::scripted::{Chunking, Script, ScriptedConnection},
    FramingConfig, FramingOutcome, FramingReader,
};

fn arb_header() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec("[A-Za-z-]{1,12}: [a-z0-9 ]{0,16}", 0..6).prop_map(|lines| {
        let mut header = String::from("HTTP/1.1 200 OK\r\n");
        for line in lines {
            header.push_str(&line);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");
        header.into_bytes()
    })
}

fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

fn arb_chunk_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..64, 1..32)
}

fn split<'a>(data: &'a [u8], sizes: &[usize]) -> Vec<&'a [u8]> {
    let mut chunks = vec![];
    let mut rest = data;
    let mut i = 0;
    while !rest.is_empty() {
        let n = sizes[i % sizes.len()].min(rest.len());
        chunks.push(&rest[..n]);
        rest = &rest[n..];
        i += 1;
    }
    chunks
}

fn feed(data: &[u8], sizes: &[usize], track: bool) -> (FramingState, FramingOutcome) {
    let mut state = FramingState::new(track);
    for chunk in split(data, sizes) {
        state.consume(chunk);
    }
    let outcome = state.finish();
    (state, outcome)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn payload_is_independent_of_chunking(
        header in arb_header(),
        body in arb_body(),
        sizes in arb_chunk_sizes(),
    ) {
        let mut stream = header.clone();
        stream.extend_from_slice(&body);

        let (state, outcome) = feed(&stream, &sizes, true);

        prop_assert_eq!(outcome, FramingOutcome::Complete);
        prop_assert_eq!(state.total_received(), stream.len() as u64);
        prop_assert_eq!(state.payload_received(), body.len() as u64);
        prop_assert_eq!(state.header_len(), Some(header.len() as u64));
    }

    #[test]
    fn payload_never_exceeds_total(
        stream in prop::collection::vec(prop::sample::select(vec![b'\r', b'\n', b'x', 0u8]), 0..512),
        sizes in arb_chunk_sizes(),
    ) {
        let (state, _) = feed(&stream, &sizes, true);

        prop_assert!(state.payload_received() <= state.total_received());
        prop_assert_eq!(state.total_received(), stream.len() as u64);
        let expected = find_terminator(&stream)
            .map(|pos| (stream.len() - pos - HEADER_TERMINATOR.len()) as u64)
            .unwrap_or(0);
        prop_assert_eq!(state.payload_received(), expected);
    }

    #[test]
    fn no_terminator_means_no_payload(
        stream in prop::collection::vec(any::<u8>().prop_filter("no LF", |b| *b != b'\n'), 0..512),
        sizes in arb_chunk_sizes(),
    ) {
        let (state, outcome) = feed(&stream, &sizes, true);

        prop_assert_eq!(outcome, FramingOutcome::Aborted);
        prop_assert_eq!(state.payload_received(), 0);
        prop_assert_eq!(state.total_received(), stream.len() as u64);
    }

    #[test]
    fn untracked_streams_are_all_payload(
        stream in prop::collection::vec(any::<u8>(), 0..512),
        sizes in arb_chunk_sizes(),
    ) {
        let (state, outcome) = feed(&stream, &sizes, false);

        prop_assert_eq!(outcome, FramingOutcome::Unframed);
        prop_assert_eq!(state.payload_received(), stream.len() as u64);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reader_agrees_with_state_over_a_transport(
        header in arb_header(),
        body in arb_body(),
        sizes in arb_chunk_sizes(),
        chunk_size in 1usize..128,
    ) {
        let mut stream = header.clone();
        stream.extend_from_slice(&body);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let transfer = runtime.block_on(async {
            let mut conn = ScriptedConnection::new(
                Script::builder()
                    .response(stream.clone())
                    .chunking(Chunking::Sizes(sizes))
                    .pace(false)
                    .build(),
            );
            let config = FramingConfig::builder().chunk_size(chunk_size).build();
            FramingReader::new(&mut conn, config).run().await
        }).unwrap();

        prop_assert_eq!(transfer.total_bytes, stream.len() as u64);
        prop_assert_eq!(transfer.payload_bytes, body.len() as u64);
        prop_assert_eq!(transfer.header_bytes, Some(header.len() as u64));
    }
}
