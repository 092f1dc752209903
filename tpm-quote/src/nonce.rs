// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Locating the anti-replay nonce inside a quote-info blob

use std::ops::Range;

use crate::constants::*;
use crate::quote_info::QuoteFormat;
use crate::types::Nonce;

/// Byte range of the nonce within `bytes`, or `None` if the blob is not a quote
/// or too short to hold one
pub fn locate_nonce(bytes: &[u8]) -> Option<Range<usize>> {
    let start = match QuoteFormat::detect(bytes)? {
        // QUOT: nonce follows the composite digest
        QuoteFormat::Legacy => QUOTE_INFO_FIXED_OFFSET + 4 + DIGEST_SIZE,
        // QUT2: nonce follows the fixed tag
        QuoteFormat::Extended => QUOTE_INFO2_FIXED_OFFSET + 4,
    };
    let range = start..start + NONCE_SIZE;
    (range.end <= bytes.len()).then_some(range)
}

/// Mutable view of the nonce embedded in `bytes`
pub fn nonce_mut(bytes: &mut [u8]) -> Option<&mut [u8; NONCE_SIZE]> {
    let range = locate_nonce(bytes)?;
    (&mut bytes[range]).try_into().ok()
}

/// Copy of the nonce embedded in `bytes`
pub fn read_nonce(bytes: &[u8]) -> Option<Nonce> {
    let range = locate_nonce(bytes)?;
    Nonce::try_from(&bytes[range]).ok()
}
