// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Obtaining signed quotes from a trust module

use std::collections::BTreeSet;
use std::fmt;

use rand::RngCore;
use tracing::{info, warn};

use crate::composite::PcrValues;
use crate::constants::*;
use crate::error::{HardwareError, InputError, Result};
use crate::pcr::PcrStore;
use crate::quote_info::{LegacyQuoteInfo, QuoteFormat, QuoteInfo, QuoteInfo2};
use crate::types::*;

/// Handle and usage secret of a loaded quoting key (AIK)
#[derive(Clone)]
pub struct QuoteKey {
    pub handle: u32,
    pub usage_secret: [u8; AUTH_DATA_SIZE],
}

impl QuoteKey {
    /// Key created with the well-known usage secret
    pub fn well_known(handle: u32) -> Self {
        Self {
            handle,
            usage_secret: WELL_KNOWN_SECRET,
        }
    }
}

impl fmt::Debug for QuoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuoteKey")
            .field("handle", &format_args!("0x{:08x}", self.handle))
            .finish_non_exhaustive()
    }
}

/// Output of TPM_Quote
#[derive(Debug, Clone)]
pub struct LegacyQuote {
    pub pcr_data: PcrComposite,
    pub signature: Vec<u8>,
}

impl LegacyQuote {
    /// The TPM_QUOTE_INFO the signature covers
    pub fn quote_info(&self, nonce: &Nonce) -> QuoteInfo {
        QuoteInfo::Legacy(LegacyQuoteInfo::new(self.pcr_data.digest(), *nonce))
    }
}

/// Output of TPM_Quote2
#[derive(Debug, Clone)]
pub struct ExtendedQuote {
    pub pcr_data: PcrInfoShort,
    pub version_info: Vec<u8>,
    pub signature: Vec<u8>,
}

impl ExtendedQuote {
    /// The TPM_QUOTE_INFO2 the signature covers
    pub fn quote_info(&self, nonce: &Nonce) -> QuoteInfo {
        QuoteInfo::Extended(QuoteInfo2::new(*nonce, self.pcr_data.clone()))
    }
}

/// Capabilities of the trust hardware needed for attestation
pub trait TrustModule {
    /// Number of PCRs implemented
    fn pcr_count(&mut self) -> Result<u32, HardwareError>;

    fn pcr_read(&mut self, index: u32) -> Result<PcrValue, HardwareError>;

    fn quote(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<LegacyQuote, HardwareError>;

    fn quote2(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<ExtendedQuote, HardwareError>;
}

/// A quote-info blob and the signature over it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedQuote {
    pub format: QuoteFormat,
    pub quote_info: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Produces quotes with one key on one trust module
pub struct QuoteService<'a, M: TrustModule + ?Sized> {
    module: &'a mut M,
    key: QuoteKey,
}

impl<'a, M: TrustModule + ?Sized> QuoteService<'a, M> {
    pub fn new(module: &'a mut M, key: QuoteKey) -> Self {
        Self { module, key }
    }

    /// Quote `pcrs` with `nonce`, preferring TPM_Quote2
    ///
    /// If the extended quote fails for any reason a single legacy quote is
    /// attempted; its failure is returned as is. TPM_QUOTE_INFO carries no
    /// selection, so the legacy quote always uses a 2-byte selection and
    /// cannot cover PCRs above 15.
    pub fn quote(&mut self, pcrs: &[u32], nonce: &[u8]) -> Result<SignedQuote> {
        let nonce = Nonce::try_from(nonce)?;
        let selection = self.selection(pcrs)?;

        match self.module.quote2(&self.key, &nonce, &selection) {
            Ok(quote) => Ok(SignedQuote {
                format: QuoteFormat::Extended,
                quote_info: quote.quote_info(&nonce).encode(),
                signature: quote.signature,
            }),
            Err(err) => {
                warn!("{err}, falling back to legacy quote command");
                let selection =
                    PcrSelection::with_indices(LEGACY_SELECT_SIZE, selection.indices())?;
                let quote = self.module.quote(&self.key, &nonce, &selection)?;
                Ok(SignedQuote {
                    format: QuoteFormat::Legacy,
                    quote_info: quote.quote_info(&nonce).encode(),
                    signature: quote.signature,
                })
            }
        }
    }

    /// Quote `pcrs` with a random nonce and read back the quoted PCR values
    pub fn pcr_hash(&mut self, pcrs: &[u32]) -> Result<(SignedQuote, PcrValues)> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let quote = self.quote(pcrs, &nonce)?;
        let values = self.pcr_values(pcrs)?;
        info!(
            "quoted {} PCRs using the {} format",
            values.len(),
            quote.format.as_str()
        );
        Ok((quote, values))
    }

    /// Current values of `pcrs`
    pub fn pcr_values(&mut self, pcrs: &[u32]) -> Result<PcrValues> {
        PcrStore::new(&mut *self.module).read(pcrs)
    }

    /// Validate `pcrs` against the hardware and build the selection to quote
    fn selection(&mut self, pcrs: &[u32]) -> Result<PcrSelection> {
        let count = self.module.pcr_count()?;
        let indices = validate_pcrs(pcrs, count)?;
        Ok(PcrSelection::with_indices(select_size_for(count), indices)?)
    }
}

/// Check a caller supplied PCR list: non-empty, no duplicates, all below `pcr_count`
pub(crate) fn validate_pcrs(pcrs: &[u32], pcr_count: u32) -> Result<BTreeSet<u32>, InputError> {
    if pcrs.is_empty() {
        return Err(InputError::NoPcrs);
    }
    let mut seen = BTreeSet::new();
    for &pcr in pcrs {
        if pcr >= pcr_count {
            return Err(InputError::PcrOutOfRange {
                index: pcr,
                limit: pcr_count,
            });
        }
        if !seen.insert(pcr) {
            return Err(InputError::DuplicatePcr(pcr));
        }
    }
    Ok(seen)
}
