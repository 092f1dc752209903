// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software trust module backed by an in-memory RSA key

#![allow(dead_code)]

use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::{Digest, Sha1};
use tpm_quote::*;

pub const AIK_HANDLE: u32 = 0x0100_0000;

pub struct SoftTpm {
    key: RsaPrivateKey,
    pub pcrs: Vec<PcrValue>,
    pub quote2_supported: bool,
    pub quote2_calls: usize,
    pub quote_calls: usize,
}

impl SoftTpm {
    pub fn new() -> Self {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("failed to generate AIK");
        Self {
            key,
            pcrs: (0..24u8).map(|i| PcrValue([i.wrapping_mul(0x11); 20])).collect(),
            quote2_supported: true,
            quote2_calls: 0,
            quote_calls: 0,
        }
    }

    pub fn public_key(&self) -> AikPublicKey {
        AikPublicKey::new(self.key.to_public_key())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(message))
            .expect("failed to sign quote")
    }

    fn composite(&self, selection: &PcrSelection) -> PcrComposite {
        PcrComposite {
            select: selection.clone(),
            pcr_values: selection
                .indices()
                .map(|i| self.pcrs[i as usize])
                .collect(),
        }
    }

    fn check_key(&self, key: &QuoteKey, op: &'static str) -> Result<(), HardwareError> {
        if key.handle != AIK_HANDLE {
            return Err(HardwareError::tpm(op, 12)); // TPM_INVALID_KEYHANDLE
        }
        if key.usage_secret != WELL_KNOWN_SECRET {
            return Err(HardwareError::tpm(op, 1)); // TPM_AUTHFAIL
        }
        Ok(())
    }
}

impl TrustModule for SoftTpm {
    fn pcr_count(&mut self) -> Result<u32, HardwareError> {
        Ok(self.pcrs.len() as u32)
    }

    fn pcr_read(&mut self, index: u32) -> Result<PcrValue, HardwareError> {
        self.pcrs
            .get(index as usize)
            .copied()
            .ok_or_else(|| HardwareError::tpm("reading PCR", 2))
    }

    fn quote(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<LegacyQuote, HardwareError> {
        self.quote_calls += 1;
        self.check_key(key, "performing quote")?;
        let pcr_data = self.composite(selection);
        let info = LegacyQuoteInfo::new(pcr_data.digest(), *nonce);
        Ok(LegacyQuote {
            signature: self.sign(&info.to_bytes()),
            pcr_data,
        })
    }

    fn quote2(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<ExtendedQuote, HardwareError> {
        self.quote2_calls += 1;
        if !self.quote2_supported {
            return Err(HardwareError::tpm("performing quote2", 10)); // TPM_BAD_ORDINAL
        }
        self.check_key(key, "performing quote2")?;
        let pcr_data = PcrInfoShort {
            pcr_selection: selection.clone(),
            locality_at_release: 1,
            digest_at_release: self.composite(selection).digest(),
        };
        let info = QuoteInfo2::new(*nonce, pcr_data.clone());
        Ok(ExtendedQuote {
            signature: self.sign(&info.to_bytes()),
            pcr_data,
            version_info: Vec::new(),
        })
    }
}
