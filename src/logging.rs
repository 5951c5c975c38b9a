/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Formatting helpers for the engine's log output.
//!
//! The engine logs through the [log](https://docs.rs/log) facade, using the node's identifier as
//! the log target so a host can route each node's output separately. Digests are shortened to
//! their first seven base64 characters to keep lines readable.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first
// 7 characters.
pub(crate) fn short_digest(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::from("-");
    }
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}
