// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Quote-info codec
//!
//! A quote-info blob is the exact byte sequence a TPM signs when quoting.
//! Two layouts exist, told apart only by their 4-byte fixed tag:
//!
//! ```text
//! TPM_QUOTE_INFO  (48 bytes)
//!   version[4] = 01 01 00 00 | "QUOT" | digestValue[20] | externalData[20]
//!
//! TPM_QUOTE_INFO2 (variable)
//!   tag u16 = 0x0036 | "QUT2" | externalData[20] | TPM_PCR_INFO_SHORT
//! ```

use serde::Serialize;
use serde_human_bytes as hex_bytes;

use crate::constants::*;
use crate::error::ParseError;
use crate::marshal::*;
use crate::types::{CompositeDigest, Nonce, PcrInfoShort, PcrSelection};

/// Which quote-info layout a blob uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteFormat {
    /// TPM_QUOTE_INFO, fixed tag "QUOT"
    Legacy,
    /// TPM_QUOTE_INFO2, fixed tag "QUT2"
    Extended,
}

impl QuoteFormat {
    /// Identify the layout of `bytes` by its fixed tag
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        let fixed_at = |offset: usize| bytes.get(offset..offset + 4);
        if fixed_at(QUOTE_INFO2_FIXED_OFFSET) == Some(&QUOTE_INFO2_FIXED[..]) {
            Some(QuoteFormat::Extended)
        } else if fixed_at(QUOTE_INFO_FIXED_OFFSET) == Some(&QUOTE_INFO_FIXED[..]) {
            Some(QuoteFormat::Legacy)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteFormat::Legacy => "QUOT",
            QuoteFormat::Extended => "QUT2",
        }
    }
}

/// Decoder limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Largest PCR selection (in bytes) accepted in an extended quote
    pub max_select_size: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_select_size: DEFAULT_MAX_SELECT_SIZE,
        }
    }
}

/// TPM_QUOTE_INFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyQuoteInfo {
    pub version: [u8; 4],
    pub digest_value: CompositeDigest,
    pub external_data: Nonce,
}

impl LegacyQuoteInfo {
    pub fn new(digest_value: CompositeDigest, external_data: Nonce) -> Self {
        Self {
            version: QUOTE_INFO_VERSION,
            digest_value,
            external_data,
        }
    }
}

impl Marshal for LegacyQuoteInfo {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_bytes(&self.version);
        buf.put_bytes(&QUOTE_INFO_FIXED);
        self.digest_value.marshal(buf);
        self.external_data.marshal(buf);
    }
}

impl Unmarshal for LegacyQuoteInfo {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self, ParseError> {
        let version = buf.get_array()?;
        if buf.get_array::<4>()? != QUOTE_INFO_FIXED {
            return Err(ParseError::UnknownTag);
        }
        Ok(Self {
            version,
            digest_value: CompositeDigest::unmarshal(buf)?,
            external_data: Nonce::unmarshal(buf)?,
        })
    }
}

/// TPM_QUOTE_INFO2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteInfo2 {
    pub tag: u16,
    pub external_data: Nonce,
    pub info_short: PcrInfoShort,
}

impl QuoteInfo2 {
    pub fn new(external_data: Nonce, info_short: PcrInfoShort) -> Self {
        Self {
            tag: TPM_TAG_QUOTE_INFO2,
            external_data,
            info_short,
        }
    }

    fn unmarshal_bounded(buf: &mut ResponseBuffer, max: usize) -> Result<Self, ParseError> {
        let tag = buf.get_u16()?;
        if buf.get_array::<4>()? != QUOTE_INFO2_FIXED {
            return Err(ParseError::UnknownTag);
        }
        let external_data = Nonce::unmarshal(buf)?;
        let info_short = PcrInfoShort::unmarshal_bounded(buf, max)?;
        Ok(Self {
            tag,
            external_data,
            info_short,
        })
    }
}

impl Marshal for QuoteInfo2 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_bytes(&QUOTE_INFO2_FIXED);
        self.external_data.marshal(buf);
        self.info_short.marshal(buf);
    }
}

/// A decoded quote-info blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteInfo {
    Legacy(LegacyQuoteInfo),
    Extended(QuoteInfo2),
}

impl QuoteInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::decode_with(bytes, &DecodeOptions::default())
    }

    pub fn decode_with(bytes: &[u8], opts: &DecodeOptions) -> Result<Self, ParseError> {
        Self::decode_prefix(bytes, opts).map(|(info, _)| info)
    }

    /// Decode the leading quote-info structure and report how many bytes it occupies
    pub fn decode_prefix(bytes: &[u8], opts: &DecodeOptions) -> Result<(Self, usize), ParseError> {
        if bytes.len() < LEGACY_QUOTE_INFO_SIZE {
            return Err(ParseError::TooShort {
                needed: LEGACY_QUOTE_INFO_SIZE,
                available: bytes.len(),
            });
        }
        let format = QuoteFormat::detect(bytes).ok_or(ParseError::UnknownTag)?;
        let mut buf = ResponseBuffer::new(bytes);
        let info = match format {
            QuoteFormat::Legacy => QuoteInfo::Legacy(LegacyQuoteInfo::unmarshal(&mut buf)?),
            QuoteFormat::Extended => QuoteInfo::Extended(QuoteInfo2::unmarshal_bounded(
                &mut buf,
                opts.max_select_size,
            )?),
        };
        Ok((info, buf.position()))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_bytes()
    }

    pub fn format(&self) -> QuoteFormat {
        match self {
            QuoteInfo::Legacy(_) => QuoteFormat::Legacy,
            QuoteInfo::Extended(_) => QuoteFormat::Extended,
        }
    }

    pub fn nonce(&self) -> &Nonce {
        match self {
            QuoteInfo::Legacy(q) => &q.external_data,
            QuoteInfo::Extended(q) => &q.external_data,
        }
    }

    /// Composite hash the quote attests to
    pub fn composite_digest(&self) -> &CompositeDigest {
        match self {
            QuoteInfo::Legacy(q) => &q.digest_value,
            QuoteInfo::Extended(q) => &q.info_short.digest_at_release,
        }
    }

    pub fn set_composite_digest(&mut self, digest: CompositeDigest) {
        match self {
            QuoteInfo::Legacy(q) => q.digest_value = digest,
            QuoteInfo::Extended(q) => q.info_short.digest_at_release = digest,
        }
    }

    /// Selection carried by the blob; legacy quotes carry none
    pub fn selection(&self) -> Option<&PcrSelection> {
        match self {
            QuoteInfo::Legacy(_) => None,
            QuoteInfo::Extended(q) => Some(&q.info_short.pcr_selection),
        }
    }

    /// Select size used when recomputing the composite hash
    pub fn select_size(&self) -> usize {
        self.selection()
            .map(PcrSelection::size_of_select)
            .unwrap_or(LEGACY_SELECT_SIZE)
    }

    pub fn summary(&self) -> QuoteInfoSummary {
        let (version, tag, locality) = match self {
            QuoteInfo::Legacy(q) => (Some(q.version.to_vec()), None, None),
            QuoteInfo::Extended(q) => (None, Some(q.tag), Some(q.info_short.locality_at_release)),
        };
        QuoteInfoSummary {
            format: self.format(),
            version,
            tag,
            nonce: self.nonce().0.to_vec(),
            composite_digest: self.composite_digest().0.to_vec(),
            select_size: self.select_size(),
            selected_pcrs: self
                .selection()
                .map(|s| s.indices().collect())
                .unwrap_or_default(),
            locality_at_release: locality,
        }
    }
}

impl Marshal for QuoteInfo {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            QuoteInfo::Legacy(q) => q.marshal(buf),
            QuoteInfo::Extended(q) => q.marshal(buf),
        }
    }
}

/// Human readable view of a quote-info blob
#[derive(Debug, Clone, Serialize)]
pub struct QuoteInfoSummary {
    pub format: QuoteFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<u16>,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub composite_digest: Vec<u8>,
    pub select_size: usize,
    pub selected_pcrs: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality_at_release: Option<u8>,
}
