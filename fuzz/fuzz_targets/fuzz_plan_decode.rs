// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for encoded plan decoding.
// Run with: cargo +nightly fuzz run fuzz_plan_decode
//
// Encoded plans arrive from peers and from the durable store, so decoding
// must reject any input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use quarry_planner::codec;
use quarry_planner::naming::{key_query_context, strip_node_hint};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if input.len() <= 64 * 1024 {
            let _ = codec::decode(input);
            if let Ok(header) = codec::decode_header(input) {
                let _ = codec::check_identity(&header.name, &header.name, &header.query_context);
            }
        }

        let (_, name) = strip_node_hint(input);
        let _ = key_query_context(name);
    }
});
