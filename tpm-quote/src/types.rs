// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 data types

use std::fmt;

use sha1::{Digest, Sha1};

use super::constants::*;
use super::error::{InputError, ParseError};
use super::marshal::*;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $size:expr, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; $size]> for $name {
            fn from(v: [u8; $size]) -> Self {
                Self(v)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = InputError;

            fn try_from(v: &[u8]) -> Result<Self, InputError> {
                let arr: [u8; $size] = v.try_into().map_err(|_| InputError::InvalidLength {
                    what: $what,
                    expected: $size,
                    actual: v.len(),
                })?;
                Ok(Self(arr))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

fixed_bytes!(
    /// TPM_NONCE - anti-replay value embedded in a quote
    Nonce,
    NONCE_SIZE,
    "nonce"
);

fixed_bytes!(
    /// Content of a single PCR register
    PcrValue,
    PCR_VALUE_SIZE,
    "PCR value"
);

fixed_bytes!(
    /// TPM_COMPOSITE_HASH - SHA-1 over a TPM_PCR_COMPOSITE
    CompositeDigest,
    DIGEST_SIZE,
    "composite digest"
);

impl PcrValue {
    /// Parse a value written as exactly 40 hex digits (either case)
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 2 * PCR_VALUE_SIZE {
            return None;
        }
        let mut out = [0u8; PCR_VALUE_SIZE];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }
}

impl Marshal for Nonce {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_bytes(&self.0);
    }
}

impl Unmarshal for Nonce {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self, ParseError> {
        Ok(Self(buf.get_array()?))
    }
}

impl Marshal for CompositeDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_bytes(&self.0);
    }
}

impl Unmarshal for CompositeDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self, ParseError> {
        Ok(Self(buf.get_array()?))
    }
}

/// Number of selection bytes needed to address `pcr_count` PCRs
pub fn select_size_for(pcr_count: u32) -> usize {
    pcr_count.div_ceil(8) as usize
}

/// TPM_PCR_SELECTION - bitmap of selected PCRs
///
/// Bit `i % 8` of byte `i / 8` selects PCR `i`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrSelection {
    pub pcr_select: Vec<u8>,
}

impl PcrSelection {
    /// Empty selection of `select_size` bytes
    pub fn new(select_size: usize) -> Self {
        Self {
            pcr_select: vec![0u8; select_size],
        }
    }

    /// Selection of `select_size` bytes with the given PCRs set
    pub fn with_indices(
        select_size: usize,
        pcrs: impl IntoIterator<Item = u32>,
    ) -> Result<Self, InputError> {
        let mut sel = Self::new(select_size);
        for pcr in pcrs {
            if !sel.select(pcr) {
                return Err(InputError::PcrOutOfRange {
                    index: pcr,
                    limit: sel.capacity(),
                });
            }
        }
        Ok(sel)
    }

    pub fn size_of_select(&self) -> usize {
        self.pcr_select.len()
    }

    /// Number of PCRs addressable by this selection
    pub fn capacity(&self) -> u32 {
        (self.pcr_select.len() * 8) as u32
    }

    /// Set the bit for `pcr`; returns false if it does not fit
    pub fn select(&mut self, pcr: u32) -> bool {
        let byte_idx = (pcr / 8) as usize;
        match self.pcr_select.get_mut(byte_idx) {
            Some(byte) => {
                *byte |= 1 << (pcr % 8);
                true
            }
            None => false,
        }
    }

    pub fn is_selected(&self, pcr: u32) -> bool {
        let byte_idx = (pcr / 8) as usize;
        self.pcr_select
            .get(byte_idx)
            .is_some_and(|b| b & (1 << (pcr % 8)) != 0)
    }

    /// Selected PCR indices in ascending order
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.pcr_select
            .iter()
            .enumerate()
            .flat_map(|(byte_idx, &byte)| {
                (0..8u32)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| byte_idx as u32 * 8 + bit)
            })
    }

    pub fn count(&self) -> usize {
        self.pcr_select
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum()
    }

    /// Read a selection, rejecting a declared size above `max` before reading the bitmap
    pub fn unmarshal_bounded(buf: &mut ResponseBuffer, max: usize) -> Result<Self, ParseError> {
        let size = buf.get_u16()? as usize;
        if size > max {
            return Err(ParseError::SelectionTooLarge { size, max });
        }
        Ok(Self {
            pcr_select: buf.get_bytes(size)?,
        })
    }
}

impl Marshal for PcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.pcr_select.len() as u16);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for PcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self, ParseError> {
        Self::unmarshal_bounded(buf, u16::MAX as usize)
    }
}

/// TPM_PCR_INFO_SHORT - selection, locality and digest reported by Quote2
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrInfoShort {
    pub pcr_selection: PcrSelection,
    pub locality_at_release: u8,
    pub digest_at_release: CompositeDigest,
}

impl PcrInfoShort {
    pub fn unmarshal_bounded(buf: &mut ResponseBuffer, max: usize) -> Result<Self, ParseError> {
        let pcr_selection = PcrSelection::unmarshal_bounded(buf, max)?;
        let locality_at_release = buf.get_u8()?;
        let digest_at_release = CompositeDigest::unmarshal(buf)?;
        Ok(Self {
            pcr_selection,
            locality_at_release,
            digest_at_release,
        })
    }
}

impl Marshal for PcrInfoShort {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.pcr_selection.marshal(buf);
        buf.put_u8(self.locality_at_release);
        self.digest_at_release.marshal(buf);
    }
}

impl Unmarshal for PcrInfoShort {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self, ParseError> {
        Self::unmarshal_bounded(buf, u16::MAX as usize)
    }
}

/// TPM_PCR_COMPOSITE - selection plus the selected values, as returned by TPM_Quote
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrComposite {
    pub select: PcrSelection,
    pub pcr_values: Vec<PcrValue>,
}

impl PcrComposite {
    /// SHA-1 of the marshalled composite (TPM_COMPOSITE_HASH)
    pub fn digest(&self) -> CompositeDigest {
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&Sha1::digest(self.to_bytes()));
        CompositeDigest(out)
    }
}

impl Marshal for PcrComposite {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.select.marshal(buf);
        buf.put_u32((self.pcr_values.len() * PCR_VALUE_SIZE) as u32);
        for value in &self.pcr_values {
            buf.put_bytes(&value.0);
        }
    }
}

impl Unmarshal for PcrComposite {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self, ParseError> {
        let select = PcrSelection::unmarshal(buf)?;
        let value_size = buf.get_u32()? as usize;
        if value_size % PCR_VALUE_SIZE != 0 {
            return Err(ParseError::Invalid(format!(
                "PCR composite value size {value_size} is not a multiple of {PCR_VALUE_SIZE}"
            )));
        }
        let mut pcr_values = Vec::with_capacity(value_size / PCR_VALUE_SIZE);
        for _ in 0..value_size / PCR_VALUE_SIZE {
            pcr_values.push(PcrValue(buf.get_array()?));
        }
        Ok(Self { select, pcr_values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection() {
        let sel = PcrSelection::with_indices(3, [0, 1, 2, 7]).unwrap();
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.pcr_select, vec![0x87, 0, 0]);
        assert_eq!(sel.to_bytes(), vec![0x00, 0x03, 0x87, 0x00, 0x00]);
        assert_eq!(sel.count(), 4);
    }

    #[test]
    fn test_selection_indices_ascending() {
        let sel = PcrSelection::with_indices(3, [23, 9, 0, 16]).unwrap();
        assert_eq!(sel.indices().collect::<Vec<_>>(), vec![0, 9, 16, 23]);
        assert!(sel.is_selected(9));
        assert!(!sel.is_selected(10));
        assert!(!sel.is_selected(200));
    }

    #[test]
    fn test_selection_out_of_range() {
        assert_eq!(
            PcrSelection::with_indices(1, [3, 8]),
            Err(InputError::PcrOutOfRange { index: 8, limit: 8 })
        );
    }

    #[test]
    fn test_bounded_selection() {
        let bytes = [0x00, 0x04, 0xff, 0xff, 0xff, 0xff];
        let mut buf = ResponseBuffer::new(&bytes);
        assert_eq!(
            PcrSelection::unmarshal_bounded(&mut buf, 3),
            Err(ParseError::SelectionTooLarge { size: 4, max: 3 })
        );
    }

    #[test]
    fn test_select_size_for() {
        assert_eq!(select_size_for(24), 3);
        assert_eq!(select_size_for(16), 2);
        assert_eq!(select_size_for(17), 3);
    }

    #[test]
    fn test_pcr_value_hex() {
        let v = PcrValue::from_hex(&"aB".repeat(20)).unwrap();
        assert_eq!(v.0, [0xab; 20]);
        assert!(PcrValue::from_hex(&"ab".repeat(19)).is_none());
        assert!(PcrValue::from_hex(&"zz".repeat(20)).is_none());
    }

    #[test]
    fn test_composite_parse() {
        let composite = PcrComposite {
            select: PcrSelection::with_indices(2, [0, 10]).unwrap(),
            pcr_values: vec![PcrValue([1; 20]), PcrValue([2; 20])],
        };
        let bytes = composite.to_bytes();
        assert_eq!(&bytes[..8], &[0x00, 0x02, 0x01, 0x04, 0x00, 0x00, 0x00, 0x28]);
        assert_eq!(PcrComposite::from_bytes(&bytes).unwrap(), composite);

        let mut bad = bytes.clone();
        bad[7] = 0x27;
        assert!(matches!(
            PcrComposite::from_bytes(&bad),
            Err(ParseError::Invalid(_))
        ));
    }
}
