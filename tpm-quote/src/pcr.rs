// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Reading PCR values from the trust hardware

use tracing::debug;

use crate::composite::PcrValues;
use crate::error::Result;
use crate::quote::{validate_pcrs, TrustModule};
use crate::types::PcrSelection;

/// PCR reader over a trust module
pub struct PcrStore<'a, M: TrustModule + ?Sized> {
    module: &'a mut M,
}

impl<'a, M: TrustModule + ?Sized> PcrStore<'a, M> {
    pub fn new(module: &'a mut M) -> Self {
        Self { module }
    }

    pub fn pcr_count(&mut self) -> Result<u32> {
        Ok(self.module.pcr_count()?)
    }

    /// Read `pcrs`, rejecting duplicates and indices the hardware does not have
    pub fn read(&mut self, pcrs: &[u32]) -> Result<PcrValues> {
        let count = self.module.pcr_count()?;
        let indices = validate_pcrs(pcrs, count)?;
        self.read_indices(indices)
    }

    /// Read every PCR set in `selection`
    pub fn read_selection(&mut self, selection: &PcrSelection) -> Result<PcrValues> {
        self.read_indices(selection.indices())
    }

    fn read_indices(&mut self, indices: impl IntoIterator<Item = u32>) -> Result<PcrValues> {
        let mut values = PcrValues::new();
        for index in indices {
            let value = self.module.pcr_read(index)?;
            debug!("PCR {index} = {value}");
            values.insert(index, value)?;
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, HardwareError, InputError};
    use crate::quote::{ExtendedQuote, LegacyQuote, QuoteKey};
    use crate::types::{Nonce, PcrValue};

    struct Registers(Vec<PcrValue>);

    impl TrustModule for Registers {
        fn pcr_count(&mut self) -> Result<u32, HardwareError> {
            Ok(self.0.len() as u32)
        }

        fn pcr_read(&mut self, index: u32) -> Result<PcrValue, HardwareError> {
            self.0
                .get(index as usize)
                .copied()
                .ok_or_else(|| HardwareError::tpm("reading PCR", 2))
        }

        fn quote(
            &mut self,
            _: &QuoteKey,
            _: &Nonce,
            _: &PcrSelection,
        ) -> Result<LegacyQuote, HardwareError> {
            Err(HardwareError::tpm("performing quote", 10))
        }

        fn quote2(
            &mut self,
            _: &QuoteKey,
            _: &Nonce,
            _: &PcrSelection,
        ) -> Result<ExtendedQuote, HardwareError> {
            Err(HardwareError::tpm("performing quote2", 10))
        }
    }

    fn registers() -> Registers {
        Registers((0..16u8).map(|i| PcrValue([i * 0x11; 20])).collect())
    }

    #[test]
    fn test_read_sorted() {
        let mut tpm = registers();
        let values = PcrStore::new(&mut tpm).read(&[10, 2, 7]).unwrap();
        assert_eq!(values.indices().collect::<Vec<_>>(), vec![2, 7, 10]);
        assert_eq!(values.get(2), Some(&PcrValue([0x22; 20])));
        assert!(values.to_text().starts_with(&format!("2={}\n", "22".repeat(20))));
    }

    #[test]
    fn test_read_rejects_bad_indices() {
        let mut tpm = registers();
        let mut store = PcrStore::new(&mut tpm);
        assert!(matches!(
            store.read(&[16]),
            Err(Error::Input(InputError::PcrOutOfRange { index: 16, limit: 16 }))
        ));
        assert!(matches!(
            store.read(&[3, 3]),
            Err(Error::Input(InputError::DuplicatePcr(3)))
        ));
    }

    #[test]
    fn test_read_selection() {
        let mut tpm = registers();
        let selection = PcrSelection::with_indices(2, [0, 15]).unwrap();
        let values = PcrStore::new(&mut tpm).read_selection(&selection).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values.get(15), Some(&PcrValue([0xff; 20])));
    }
}
