// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Quote verification
//!
//! The signed bytes are reconstructed from the expected quote-info blob by
//! writing the expected nonce into it, so a quote only verifies if it answers
//! that exact challenge for that exact PCR state.

use tracing::debug;

use crate::constants::NONCE_SIZE;
use crate::error::VerifyError;
use crate::nonce::locate_nonce;
use crate::pubkey::AikPublicKey;

/// Verify `signature` over `expected_hash` with its nonce replaced by `nonce`
pub fn verify_quote(
    key: &AikPublicKey,
    expected_hash: &[u8],
    nonce: &[u8],
    signature: &[u8],
) -> Result<(), VerifyError> {
    let range = locate_nonce(expected_hash).ok_or(VerifyError::MalformedHash)?;
    if nonce.len() != NONCE_SIZE {
        return Err(VerifyError::NonceSizeMismatch {
            actual: nonce.len(),
        });
    }

    let mut signed = expected_hash.to_vec();
    signed[range].copy_from_slice(nonce);
    debug!(
        "verifying {} byte signature over {}",
        signature.len(),
        hex::encode(&signed)
    );
    key.verify(&signed, signature)
}
