// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Recomputing the composite hash of an existing quote-info blob
//!
//! When PCR values are known to have changed, the expected quote-info can be
//! rebuilt without asking the TPM for a new quote: the composite digest is
//! recomputed from the new values and patched into the old blob. Everything
//! else (tag, nonce, selection bytes, locality) is kept.

use tracing::{debug, warn};

use crate::composite::{composite_digest, PcrValues};
use crate::constants::*;
use crate::error::{Error, ParseError, Result};
use crate::quote_info::{DecodeOptions, QuoteInfo};
use crate::types::CompositeDigest;

/// Tunables for [`HashUpdater`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Largest selection size accepted in the old blob
    pub max_select_size: usize,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            max_select_size: DEFAULT_MAX_SELECT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HashUpdater {
    opts: UpdateOptions,
}

impl HashUpdater {
    pub fn new(opts: UpdateOptions) -> Self {
        Self { opts }
    }

    /// Parse `index=HEX` lines and update `old` with them
    pub fn update_from_text(&self, old: &[u8], new_values: &str) -> Result<Vec<u8>> {
        let (info, consumed) = self.decode_old(old)?;
        let values = PcrValues::parse(new_values)?;
        self.patch(old, info, consumed, &values)
    }

    /// Return a copy of `old` whose composite digest covers `values`
    pub fn update(&self, old: &[u8], values: &PcrValues) -> Result<Vec<u8>> {
        let (info, consumed) = self.decode_old(old)?;
        self.patch(old, info, consumed, values)
    }

    fn decode_old(&self, old: &[u8]) -> Result<(QuoteInfo, usize)> {
        let opts = DecodeOptions {
            max_select_size: self.opts.max_select_size,
        };
        Ok(QuoteInfo::decode_prefix(old, &opts)?)
    }

    fn patch(
        &self,
        old: &[u8],
        mut info: QuoteInfo,
        consumed: usize,
        values: &PcrValues,
    ) -> Result<Vec<u8>> {
        let select_size = info.select_size();
        if let Some(index) = values.indices().find(|&i| i >= 8 * select_size as u32) {
            return Err(Error::SelectionOverflow { index, select_size });
        }

        let selection = values.selection(select_size)?;
        let digest = composite_digest(&selection, values)?;
        debug!(
            "new composite digest {digest} over {} PCRs, select size {select_size}",
            values.len()
        );

        let mut out = old.to_vec();
        match info {
            QuoteInfo::Extended(_) => {
                info.set_composite_digest(digest);
                let encoded = info.encode();
                if encoded.len() != consumed {
                    return Err(ParseError::LengthMismatch {
                        expected: consumed,
                        actual: encoded.len(),
                    }
                    .into());
                }
                out[..consumed].copy_from_slice(&encoded);
            }
            QuoteInfo::Legacy(_) => patch_legacy(&mut out, &digest),
        }
        Ok(out)
    }
}

/// Write the digest of a legacy blob, counting from the end of the buffer
///
/// The digest is assumed to sit immediately before the trailing nonce, i.e.
/// the blob must end right after TPM_QUOTE_INFO.
fn patch_legacy(out: &mut [u8], digest: &CompositeDigest) {
    if out.len() != LEGACY_QUOTE_INFO_SIZE {
        warn!(
            "legacy quote info is {} bytes, expected {LEGACY_QUOTE_INFO_SIZE}; patching relative to the end",
            out.len()
        );
    }
    let start = out.len() - DIGEST_SIZE - NONCE_SIZE;
    out[start..start + DIGEST_SIZE].copy_from_slice(&digest.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InputError;
    use crate::quote_info::{LegacyQuoteInfo, QuoteInfo2};
    use crate::types::{Nonce, PcrInfoShort, PcrSelection, PcrValue};

    fn extended_blob(select: &[u8]) -> Vec<u8> {
        QuoteInfo::Extended(QuoteInfo2::new(
            Nonce([0xab; 20]),
            PcrInfoShort {
                pcr_selection: PcrSelection {
                    pcr_select: select.to_vec(),
                },
                locality_at_release: 0x1f,
                digest_at_release: CompositeDigest([0; 20]),
            },
        ))
        .encode()
    }

    fn legacy_blob() -> Vec<u8> {
        QuoteInfo::Legacy(LegacyQuoteInfo::new(
            CompositeDigest([0; 20]),
            Nonce([0xcd; 20]),
        ))
        .encode()
    }

    fn line(index: u32, byte: &str) -> String {
        format!("{index}={}\n", byte.repeat(20))
    }

    #[test]
    fn test_extended_update() {
        let old = extended_blob(&[0x07, 0x00, 0x00]);
        let text = [line(2, "22"), line(0, "00"), line(1, "11")].concat();
        let new = HashUpdater::default().update_from_text(&old, &text).unwrap();

        assert_eq!(new.len(), old.len());
        // Everything but the digest is untouched
        assert_eq!(&new[..new.len() - 20], &old[..old.len() - 20]);

        let values = PcrValues::parse(&text).unwrap();
        let expected = composite_digest(&values.selection(3).unwrap(), &values).unwrap();
        assert_eq!(&new[new.len() - 20..], &expected.0);
    }

    #[test]
    fn test_selection_bytes_preserved() {
        // Old blob selects PCR 0..=7, new values only cover PCR 4
        let old = extended_blob(&[0xff]);
        let new = HashUpdater::default()
            .update_from_text(&old, &line(4, "aa"))
            .unwrap();
        let info = QuoteInfo::decode(&new).unwrap();
        assert_eq!(info.selection().unwrap().pcr_select, vec![0xff]);

        let values = PcrValues::parse(&line(4, "aa")).unwrap();
        let sel = PcrSelection::with_indices(1, [4]).unwrap();
        assert_eq!(
            info.composite_digest(),
            &composite_digest(&sel, &values).unwrap()
        );
    }

    #[test]
    fn test_trailing_bytes_kept() {
        let mut old = extended_blob(&[0x01, 0x00]);
        old.extend_from_slice(b"tail");
        let new = HashUpdater::default()
            .update_from_text(&old, &line(0, "01"))
            .unwrap();
        assert_eq!(&new[new.len() - 4..], b"tail");
        assert_eq!(new.len(), old.len());
    }

    #[test]
    fn test_legacy_update() {
        let old = legacy_blob();
        let text = line(15, "ff");
        let new = HashUpdater::default().update_from_text(&old, &text).unwrap();
        assert_eq!(&new[..8], &old[..8]);
        assert_eq!(&new[28..], &old[28..]);

        let values = PcrValues::parse(&text).unwrap();
        let sel = values.selection(LEGACY_SELECT_SIZE).unwrap();
        assert_eq!(&new[8..28], &composite_digest(&sel, &values).unwrap().0);
    }

    #[test]
    fn test_legacy_overflow() {
        let err = HashUpdater::default()
            .update_from_text(&legacy_blob(), &line(16, "00"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SelectionOverflow {
                index: 16,
                select_size: 2
            }
        ));
    }

    #[test]
    fn test_select_size_one_rejects_pcr9() {
        let old = extended_blob(&[0x01]);
        let err = HashUpdater::default()
            .update_from_text(&old, &[line(0, "00"), line(9, "99")].concat())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SelectionOverflow {
                index: 9,
                select_size: 1
            }
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let old = extended_blob(&[0x03, 0x00, 0x00]);
        let err = HashUpdater::default()
            .update_from_text(&old, &[line(1, "00"), line(1, "11")].concat())
            .unwrap_err();
        assert!(matches!(err, Error::Input(InputError::DuplicatePcr(1))));
    }

    #[test]
    fn test_old_hash_errors() {
        let updater = HashUpdater::default();
        let text = line(0, "00");
        assert!(matches!(
            updater.update_from_text(&[0u8; 60], &text),
            Err(Error::Format(ParseError::UnknownTag))
        ));
        assert!(matches!(
            updater.update_from_text(&legacy_blob()[..40], &text),
            Err(Error::Format(ParseError::TooShort { .. }))
        ));
        assert!(matches!(
            updater.update_from_text(&extended_blob(&[0, 0, 0, 1]), &text),
            Err(Error::Format(ParseError::SelectionTooLarge { size: 4, max: 3 }))
        ));

        let wide = HashUpdater::new(UpdateOptions { max_select_size: 4 });
        let new = wide
            .update_from_text(&extended_blob(&[0, 0, 0, 1]), &line(31, "00"))
            .unwrap();
        assert_eq!(new.len(), extended_blob(&[0, 0, 0, 1]).len());
    }

    #[test]
    fn test_update_typed_values() {
        let old = extended_blob(&[0x03, 0x00]);
        let values: PcrValues = [(0, PcrValue([1; 20])), (1, PcrValue([2; 20]))]
            .into_iter()
            .collect();
        let from_typed = HashUpdater::default().update(&old, &values).unwrap();
        let from_text = HashUpdater::default()
            .update_from_text(&old, &values.to_text())
            .unwrap();
        assert_eq!(from_typed, from_text);
    }
}
