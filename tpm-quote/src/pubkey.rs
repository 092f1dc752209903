// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Attestation identity key (AIK) public keys
//!
//! Three DER containers are accepted:
//! - X.509 SubjectPublicKeyInfo
//! - PKCS#1 RSAPublicKey
//! - TSS key blob: `SEQUENCE { INTEGER version, INTEGER blobType, INTEGER length, OCTET STRING blob }`
//!   where the blob is a marshalled TPM_PUBKEY

use der::asn1::OctetString;
use der::{Decode, Encode, Sequence};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::constants::*;
use crate::error::{ParseError, VerifyError};
use crate::marshal::*;

/// Public exponent implied by an empty TPM_RSA_KEY_PARMS exponent
const DEFAULT_EXPONENT: u32 = 65537;
/// TPM_ES_NONE / TPM_SS_RSASSAPKCS1v15_SHA1
const TPM_ES_NONE: u16 = 0x0001;
const TPM_SS_RSASSAPKCS1V15_SHA1: u16 = 0x0002;

/// DER wrapper the TSS puts around exported key blobs
#[derive(Debug, Clone, PartialEq, Eq, Sequence)]
struct TssBlob {
    version: u32,
    blob_type: u32,
    length: u32,
    blob: OctetString,
}

fn der_error(err: der::Error) -> ParseError {
    ParseError::Invalid(format!("TSS blob: {err}"))
}

/// RSA public key used to check quote signatures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AikPublicKey {
    key: RsaPublicKey,
}

impl AikPublicKey {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Parse any of the supported DER containers
    pub fn from_der(der: &[u8]) -> Result<Self, VerifyError> {
        if let Ok(key) = RsaPublicKey::from_public_key_der(der) {
            debug!("loaded SubjectPublicKeyInfo RSA key");
            return Ok(Self { key });
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_der(der) {
            debug!("loaded PKCS#1 RSA key");
            return Ok(Self { key });
        }
        let pubkey = TpmPubKey::from_tss_blob(der)
            .map_err(|e| VerifyError::InvalidPublicKey(e.to_string()))?;
        debug!("loaded TSS TPM_PUBKEY blob");
        Ok(Self {
            key: pubkey.to_rsa()?,
        })
    }

    pub fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }

    /// Check an RSASSA-PKCS1-v1_5 / SHA-1 signature over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
        let digest = Sha1::digest(message);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .map_err(|err| {
                debug!("RSA signature verification failed: {err}");
                VerifyError::SignatureInvalid
            })
    }

    /// Encode as a TSS key blob
    pub fn to_tss_blob(&self) -> Result<Vec<u8>, ParseError> {
        TpmPubKey::from_rsa(&self.key).to_tss_blob()
    }
}

/// TPM_PUBKEY for an RSA key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmPubKey {
    pub algorithm_id: u32,
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub key_length: u32,
    pub num_primes: u32,
    pub exponent: Vec<u8>,
    pub modulus: Vec<u8>,
}

impl TpmPubKey {
    pub fn from_rsa(key: &RsaPublicKey) -> Self {
        let modulus = key.n().to_bytes_be();
        let exponent = if *key.e() == BigUint::from(DEFAULT_EXPONENT) {
            Vec::new()
        } else {
            key.e().to_bytes_be()
        };
        Self {
            algorithm_id: tpm_alg::RSA,
            enc_scheme: TPM_ES_NONE,
            sig_scheme: TPM_SS_RSASSAPKCS1V15_SHA1,
            key_length: (modulus.len() * 8) as u32,
            num_primes: 2,
            exponent,
            modulus,
        }
    }

    pub fn to_rsa(&self) -> Result<RsaPublicKey, VerifyError> {
        if self.algorithm_id != tpm_alg::RSA {
            return Err(VerifyError::InvalidPublicKey(format!(
                "unsupported key algorithm {}",
                self.algorithm_id
            )));
        }
        let e = if self.exponent.is_empty() {
            BigUint::from(DEFAULT_EXPONENT)
        } else {
            BigUint::from_bytes_be(&self.exponent)
        };
        RsaPublicKey::new(BigUint::from_bytes_be(&self.modulus), e)
            .map_err(|e| VerifyError::InvalidPublicKey(e.to_string()))
    }

    /// Parse the DER wrapper produced by the TSS and unmarshal the TPM_PUBKEY inside
    pub fn from_tss_blob(der: &[u8]) -> Result<Self, ParseError> {
        let wrapper = TssBlob::from_der(der).map_err(der_error)?;
        if wrapper.version != tss_blob::STRUCT_VERSION {
            return Err(ParseError::Invalid(format!(
                "unsupported TSS blob version {}",
                wrapper.version
            )));
        }
        if wrapper.blob_type != tss_blob::PUBKEY {
            return Err(ParseError::Invalid(format!(
                "TSS blob type {} is not a public key",
                wrapper.blob_type
            )));
        }
        let blob = wrapper.blob.as_bytes();
        if wrapper.length as usize != blob.len() {
            return Err(ParseError::LengthMismatch {
                expected: wrapper.length as usize,
                actual: blob.len(),
            });
        }
        Self::from_bytes(blob)
    }

    pub fn to_tss_blob(&self) -> Result<Vec<u8>, ParseError> {
        let blob = self.to_bytes();
        TssBlob {
            version: tss_blob::STRUCT_VERSION,
            blob_type: tss_blob::PUBKEY,
            length: blob.len() as u32,
            blob: OctetString::new(blob).map_err(der_error)?,
        }
        .to_der()
        .map_err(der_error)
    }
}

impl Marshal for TpmPubKey {
    fn marshal(&self, buf: &mut CommandBuffer) {
        // TPM_KEY_PARMS
        buf.put_u32(self.algorithm_id);
        buf.put_u16(self.enc_scheme);
        buf.put_u16(self.sig_scheme);
        let mut parms = CommandBuffer::new();
        parms.put_u32(self.key_length);
        parms.put_u32(self.num_primes);
        parms.put_sized(&self.exponent);
        buf.put_sized(parms.as_bytes());
        // TPM_STORE_PUBKEY
        buf.put_sized(&self.modulus);
    }
}

impl Unmarshal for TpmPubKey {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self, ParseError> {
        let algorithm_id = buf.get_u32()?;
        let enc_scheme = buf.get_u16()?;
        let sig_scheme = buf.get_u16()?;
        let parms = buf.get_sized()?;
        let mut prd = ResponseBuffer::new(&parms);
        let key_length = prd.get_u32()?;
        let num_primes = prd.get_u32()?;
        let exponent = prd.get_sized()?;
        let modulus = buf.get_sized()?;
        Ok(Self {
            algorithm_id,
            enc_scheme,
            sig_scheme,
            key_length,
            num_primes,
            exponent,
            modulus,
        })
    }
}

#[cfg(test)]
mod tests {
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    use super::*;

    fn test_key() -> RsaPublicKey {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 1024).unwrap().to_public_key()
    }

    #[test]
    fn test_all_containers() {
        let key = test_key();
        let spki = key.to_public_key_der().unwrap();
        let pkcs1 = key.to_pkcs1_der().unwrap();
        let tss = AikPublicKey::new(key.clone()).to_tss_blob().unwrap();

        for der in [spki.as_bytes(), pkcs1.as_bytes(), tss.as_slice()] {
            assert_eq!(AikPublicKey::from_der(der).unwrap().rsa(), &key);
        }
    }

    #[test]
    fn test_tss_blob_layout() {
        let key = test_key();
        let blob = TpmPubKey::from_rsa(&key);
        assert!(blob.exponent.is_empty());
        assert_eq!(blob.key_length, 1024);

        let der = blob.to_tss_blob().unwrap();
        // SEQUENCE with long-form length, then INTEGER 1, INTEGER 2
        assert_eq!(&der[..2], &[0x30, 0x81]);
        assert_eq!(&der[3..9], &[0x02, 0x01, 0x01, 0x02, 0x01, 0x02]);
        assert_eq!(TpmPubKey::from_tss_blob(&der).unwrap(), blob);
    }

    #[test]
    fn test_invalid_key() {
        assert!(matches!(
            AikPublicKey::from_der(&[0x30, 0x03, 0x02, 0x01, 0x05]),
            Err(VerifyError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            AikPublicKey::from_der(b"not a key"),
            Err(VerifyError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_tss_blob_header_checks() {
        let blob = TpmPubKey::from_rsa(&test_key()).to_bytes();
        let wrap = |version, blob_type, length| {
            TssBlob {
                version,
                blob_type,
                length,
                blob: OctetString::new(blob.clone()).unwrap(),
            }
            .to_der()
            .unwrap()
        };
        let len = blob.len() as u32;
        assert!(TpmPubKey::from_tss_blob(&wrap(1, 2, len)).is_ok());
        assert!(matches!(
            TpmPubKey::from_tss_blob(&wrap(2, 2, len)),
            Err(ParseError::Invalid(_))
        ));
        assert!(matches!(
            TpmPubKey::from_tss_blob(&wrap(1, 1, len)),
            Err(ParseError::Invalid(_))
        ));
        assert!(matches!(
            TpmPubKey::from_tss_blob(&wrap(1, 2, len + 1)),
            Err(ParseError::LengthMismatch { .. })
        ));

        // Trailing bytes after the SEQUENCE are not a valid blob
        let mut trailing = wrap(1, 2, len);
        trailing.push(0);
        assert!(TpmPubKey::from_tss_blob(&trailing).is_err());
    }
}
