// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PCR value sets and the TPM_COMPOSITE_HASH computation
//!
//! The composite hash is SHA-1 over a TPM_PCR_COMPOSITE:
//!
//! ```text
//! sizeOfSelect u16 | pcrSelect[sizeOfSelect] | valueSize u32 (= n * 20) | values in ascending PCR order
//! ```

use std::collections::btree_map::{self, BTreeMap};
use std::fmt::Write as _;

use sha1::{Digest, Sha1};

use crate::constants::{DIGEST_SIZE, PCR_VALUE_SIZE};
use crate::error::InputError;
use crate::marshal::Marshal;
use crate::types::{CompositeDigest, PcrSelection, PcrValue};

/// PCR values keyed by index, always iterated in ascending index order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrValues {
    values: BTreeMap<u32, PcrValue>,
}

impl PcrValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, rejecting a second value for the same PCR
    pub fn insert(&mut self, index: u32, value: PcrValue) -> Result<(), InputError> {
        match self.values.entry(index) {
            btree_map::Entry::Occupied(_) => Err(InputError::DuplicatePcr(index)),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<&PcrValue> {
        self.values.get(&index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &PcrValue)> + '_ {
        self.values.iter().map(|(&i, v)| (i, v))
    }

    /// Parse `index=HEX` lines
    ///
    /// Lines may come in any order. Whitespace between `=` and the value is
    /// allowed, the value must be exactly 40 hex digits and anything after it
    /// is ignored. Blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, InputError> {
        let mut values = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (index, value) = parse_line(line).map_err(|reason| InputError::InvalidEntry {
                line: lineno + 1,
                reason,
            })?;
            values.insert(index, value)?;
        }
        Ok(values)
    }

    /// Render as `index=HEX` lines, uppercase hex, ascending index
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.values.len() * (2 * PCR_VALUE_SIZE + 4));
        for (index, value) in &self.values {
            let _ = writeln!(out, "{index}={}", hex::encode_upper(value.0));
        }
        out
    }

    /// Selection of `select_size` bytes covering exactly these indices
    pub fn selection(&self, select_size: usize) -> Result<PcrSelection, InputError> {
        PcrSelection::with_indices(select_size, self.indices())
    }
}

impl FromIterator<(u32, PcrValue)> for PcrValues {
    /// Later duplicates replace earlier ones; use [`PcrValues::insert`] to reject them
    fn from_iter<T: IntoIterator<Item = (u32, PcrValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

fn parse_line(line: &str) -> Result<(u32, PcrValue), String> {
    let line = line.trim_start();
    let digits_end = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len());
    if digits_end == 0 {
        return Err("cannot read PCR index".into());
    }
    let index: u32 = line[..digits_end]
        .parse()
        .map_err(|_| format!("PCR index {} out of range", &line[..digits_end]))?;
    let rest = &line[digits_end..];
    let eq = rest
        .find('=')
        .ok_or_else(|| format!("ill-formed entry for PCR {index}"))?;
    let value = rest[eq + 1..].trim_start();
    let hex_end = value
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(value.len());
    PcrValue::from_hex(&value[..hex_end])
        .map(|v| (index, v))
        .ok_or_else(|| format!("ill-formed entry for PCR {index}"))
}

/// Streaming composite hash
///
/// The selection and value count are hashed up front; values must then be
/// fed in ascending index order, one per selected PCR.
pub struct CompositeHasher<'a> {
    sha: Sha1,
    selection: &'a PcrSelection,
    pending: std::vec::IntoIter<u32>,
}

impl<'a> CompositeHasher<'a> {
    pub fn new(selection: &'a PcrSelection) -> Self {
        let expected: Vec<u32> = selection.indices().collect();
        let mut sha = Sha1::new();
        sha.update(selection.to_bytes());
        sha.update(((expected.len() * PCR_VALUE_SIZE) as u32).to_be_bytes());
        Self {
            sha,
            selection,
            pending: expected.into_iter(),
        }
    }

    pub fn update(&mut self, index: u32, value: &PcrValue) -> Result<(), InputError> {
        if !self.selection.is_selected(index) {
            return Err(InputError::UnselectedValue(index));
        }
        match self.pending.next() {
            Some(expected) if expected == index => {
                self.sha.update(value.0);
                Ok(())
            }
            Some(expected) => Err(InputError::MissingValue(expected)),
            // Selected but already consumed
            None => Err(InputError::DuplicatePcr(index)),
        }
    }

    pub fn finalize(mut self) -> Result<CompositeDigest, InputError> {
        if let Some(missing) = self.pending.next() {
            return Err(InputError::MissingValue(missing));
        }
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&self.sha.finalize());
        Ok(CompositeDigest(out))
    }
}

/// Composite hash of `values` under `selection`
///
/// Every selected PCR needs a value and every value must be selected.
pub fn composite_digest(
    selection: &PcrSelection,
    values: &PcrValues,
) -> Result<CompositeDigest, InputError> {
    let mut hasher = CompositeHasher::new(selection);
    for (index, value) in values.iter() {
        hasher.update(index, value)?;
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PcrComposite;

    fn vector_values() -> PcrValues {
        [
            (2, PcrValue([0x22; 20])),
            (0, PcrValue([0x00; 20])),
            (1, PcrValue([0x11; 20])),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_digest_vector() {
        let values = vector_values();
        let selection = values.selection(1).unwrap();
        assert_eq!(selection.to_bytes(), vec![0x00, 0x01, 0x07]);
        let digest = composite_digest(&selection, &values).unwrap();
        assert_eq!(
            digest.to_hex(),
            "d63fd8c0e21e5b6ba03c163b24caef80bfa4d9a5"
        );
    }

    #[test]
    fn test_digest_matches_composite() {
        let values = vector_values();
        let selection = values.selection(3).unwrap();
        let composite = PcrComposite {
            select: selection.clone(),
            pcr_values: values.iter().map(|(_, v)| *v).collect(),
        };
        assert_eq!(
            composite.digest(),
            composite_digest(&selection, &values).unwrap()
        );
    }

    #[test]
    fn test_select_size_changes_digest() {
        let values = vector_values();
        let d1 = composite_digest(&values.selection(1).unwrap(), &values).unwrap();
        let d2 = composite_digest(&values.selection(2).unwrap(), &values).unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn test_missing_and_unselected() {
        let values = vector_values();
        let selection = PcrSelection::with_indices(1, [0, 1, 2, 3]).unwrap();
        assert_eq!(
            composite_digest(&selection, &values),
            Err(InputError::MissingValue(3))
        );
        let selection = PcrSelection::with_indices(1, [0, 2]).unwrap();
        assert_eq!(
            composite_digest(&selection, &values),
            Err(InputError::UnselectedValue(1))
        );
    }

    #[test]
    fn test_hasher_order() {
        let selection = PcrSelection::with_indices(1, [0, 1]).unwrap();
        let mut hasher = CompositeHasher::new(&selection);
        assert_eq!(
            hasher.update(1, &PcrValue([1; 20])),
            Err(InputError::MissingValue(0))
        );
    }

    #[test]
    fn test_parse_values() {
        let text = format!(
            "17= {}\n\n3={}  trailing\n",
            "ab".repeat(20),
            "0F".repeat(20)
        );
        let values = PcrValues::parse(&text).unwrap();
        assert_eq!(values.indices().collect::<Vec<_>>(), vec![3, 17]);
        assert_eq!(values.get(17), Some(&PcrValue([0xab; 20])));
        assert_eq!(
            values.to_text(),
            format!("3={}\n17={}\n", "0F".repeat(20), "AB".repeat(20))
        );
    }

    #[test]
    fn test_parse_errors() {
        let dup = format!("1={0}\n1={0}\n", "00".repeat(20));
        assert_eq!(PcrValues::parse(&dup), Err(InputError::DuplicatePcr(1)));

        let short = format!("4={}\n", "00".repeat(19));
        assert!(matches!(
            PcrValues::parse(&short),
            Err(InputError::InvalidEntry { line: 1, .. })
        ));

        let no_index = format!("x={}\n", "00".repeat(20));
        assert!(matches!(
            PcrValues::parse(&no_index),
            Err(InputError::InvalidEntry { .. })
        ));

        let indented = format!("  \t9={}\n", "00".repeat(20));
        assert_eq!(
            PcrValues::parse(&indented).unwrap().indices().collect::<Vec<_>>(),
            vec![9]
        );

        let no_eq = format!("5 {}\n", "00".repeat(20));
        assert!(matches!(
            PcrValues::parse(&no_eq),
            Err(InputError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn test_order_independent() {
        let a = PcrValues::parse(&format!("0={}\n5={}\n", "11".repeat(20), "22".repeat(20))).unwrap();
        let b = PcrValues::parse(&format!("5={}\n0={}\n", "22".repeat(20), "11".repeat(20))).unwrap();
        assert_eq!(a, b);
        let sel = a.selection(2).unwrap();
        assert_eq!(
            composite_digest(&sel, &a).unwrap(),
            composite_digest(&sel, &b).unwrap()
        );
    }

    #[test]
    fn test_swapped_values_change_digest() {
        let a = PcrValues::parse(&format!("0={}\n5={}\n", "11".repeat(20), "22".repeat(20))).unwrap();
        let b = PcrValues::parse(&format!("0={}\n5={}\n", "22".repeat(20), "11".repeat(20))).unwrap();
        let sel = a.selection(2).unwrap();
        assert_eq!(sel, b.selection(2).unwrap());
        assert_ne!(
            composite_digest(&sel, &a).unwrap(),
            composite_digest(&sel, &b).unwrap()
        );
    }
}
