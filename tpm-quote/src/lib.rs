// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 PCR quotes in pure Rust
//!
//! This crate obtains, verifies and re-targets TPM 1.2 quotes, communicating
//! directly with the TPM device without C library dependencies.
//!
//! ## Features
//!
//! - **Quote-info codec**: the legacy `QUOT` and extended `QUT2` layouts,
//!   told apart by their fixed tag
//! - **Composite hashing**: TPM_COMPOSITE_HASH over a PCR selection and values
//! - **Hash update**: recompute the composite hash of an existing quote-info
//!   blob for new PCR values, without a TPM round-trip
//! - **Quoting**: `TPM_Quote2` with a one-shot fallback to `TPM_Quote`, under
//!   OIAP authorization
//! - **Verification**: RSASSA-PKCS1-v1_5/SHA-1 over the quote-info with the
//!   expected nonce substituted
//!
//! ## Example
//!
//! ```no_run
//! use tpm_quote::{QuoteKey, QuoteService, TpmContext};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let quote = QuoteService::new(&mut ctx, QuoteKey::well_known(0x0100_0000))
//!     .quote(&[0, 1, 2], &[0u8; 20])?;
//! println!("{}", hex::encode(&quote.quote_info));
//! # Ok::<(), tpm_quote::Error>(())
//! ```

mod commands;
mod composite;
mod constants;
mod device;
mod error;
mod marshal;
mod nonce;
mod pcr;
mod pubkey;
mod quote;
mod quote_info;
mod session;
mod types;
mod update;
mod verify;

pub use commands::TpmContext;
pub use composite::{composite_digest, CompositeHasher, PcrValues};
pub use constants::*;
pub use error::*;
pub use nonce::{locate_nonce, nonce_mut, read_nonce};
pub use pcr::PcrStore;
pub use pubkey::{AikPublicKey, TpmPubKey};
pub use quote::{ExtendedQuote, LegacyQuote, QuoteKey, QuoteService, SignedQuote, TrustModule};
pub use quote_info::{
    DecodeOptions, LegacyQuoteInfo, QuoteFormat, QuoteInfo, QuoteInfo2, QuoteInfoSummary,
};
pub use types::*;
pub use update::{HashUpdater, UpdateOptions};
pub use verify::verify_quote;

// Re-export device for advanced usage
pub use device::{TpmCommand, TpmDevice, TpmResponse, TpmTransport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{flush_specific, OiapSession};
