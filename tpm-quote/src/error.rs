// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the codec, the hash updater, the quote service and the verifier

use std::fmt;

use thiserror::Error;

use crate::constants::tpm_rc_name;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed quote-info or TPM structure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    TooShort { needed: usize, available: usize },
    #[error("not a quote: unknown fixed tag")]
    UnknownTag,
    #[error("PCR selection of {size} bytes exceeds the supported maximum of {max}")]
    SelectionTooLarge { size: usize, max: usize },
    #[error("re-encoded structure is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("invalid encoding: {0}")]
    Invalid(String),
}

/// Caller supplied data that cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("PCR {0} already specified")]
    DuplicatePcr(u32),
    #[error("PCR {index} out of range, the TPM has {limit} PCRs")]
    PcrOutOfRange { index: u32, limit: u32 },
    #[error("no PCRs selected")]
    NoPcrs,
    #[error("{what} must be {expected} bytes, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("line {line}: {reason}")]
    InvalidEntry { line: usize, reason: String },
    #[error("no value supplied for selected PCR {0}")]
    MissingValue(u32),
    #[error("value supplied for PCR {0}, which is not selected")]
    UnselectedValue(u32),
}

/// What went wrong underneath a hardware call
#[derive(Debug, Error)]
pub enum HardwareErrorKind {
    #[error("{}", describe_rc(*.0))]
    Tpm(u32),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(String),
}

fn describe_rc(code: u32) -> String {
    match tpm_rc_name(code) {
        Some(name) => name.to_string(),
        None => format!("0x{code:x}"),
    }
}

/// Failure reported by the trust hardware or its driver
#[derive(Debug, Error)]
#[error("error while {operation}. Error code: {kind}")]
pub struct HardwareError {
    pub operation: &'static str,
    #[source]
    pub kind: HardwareErrorKind,
}

impl HardwareError {
    pub fn tpm(operation: &'static str, code: u32) -> Self {
        Self {
            operation,
            kind: HardwareErrorKind::Tpm(code),
        }
    }

    pub fn io(operation: &'static str, err: std::io::Error) -> Self {
        Self {
            operation,
            kind: HardwareErrorKind::Io(err),
        }
    }

    pub fn protocol(operation: &'static str, msg: impl Into<String>) -> Self {
        Self {
            operation,
            kind: HardwareErrorKind::Protocol(msg.into()),
        }
    }

    /// Raw TPM return code, if the TPM answered with one
    pub fn code(&self) -> Option<u32> {
        match self.kind {
            HardwareErrorKind::Tpm(code) => Some(code),
            _ => None,
        }
    }
}

/// Outcome of a failed quote verification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("hash format error: nonce not found")]
    MalformedHash,
    #[error("nonce wrong size: expected 20 bytes, got {actual}")]
    NonceSizeMismatch { actual: usize },
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("signature verification failed")]
    SignatureInvalid,
}

/// Coarse classification used to pick user-facing diagnostics and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Format,
    Input,
    Compatibility,
    Hardware,
    Verification,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Format => "format error",
            ErrorCategory::Input => "input error",
            ErrorCategory::Compatibility => "compatibility error",
            ErrorCategory::Hardware => "hardware error",
            ErrorCategory::Verification => "verification failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] ParseError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("specified PCR {index} exceeds the {select_size}-byte selection of the hash")]
    SelectionOverflow { index: u32, select_size: usize },
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Format(_) => ErrorCategory::Format,
            Error::Input(_) => ErrorCategory::Input,
            Error::SelectionOverflow { .. } => ErrorCategory::Compatibility,
            Error::Hardware(_) => ErrorCategory::Hardware,
            Error::Verify(VerifyError::SignatureInvalid) => ErrorCategory::Verification,
            Error::Verify(VerifyError::MalformedHash) => ErrorCategory::Format,
            Error::Verify(VerifyError::InvalidPublicKey(_)) => ErrorCategory::Format,
            Error::Verify(VerifyError::NonceSizeMismatch { .. }) => ErrorCategory::Input,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_error_message() {
        let err = HardwareError::tpm("performing quote", 1);
        assert_eq!(
            err.to_string(),
            "error while performing quote. Error code: TPM_AUTHFAIL"
        );
        let err = HardwareError::tpm("performing quote", 0x4242);
        assert_eq!(
            err.to_string(),
            "error while performing quote. Error code: 0x4242"
        );
        assert_eq!(err.code(), Some(0x4242));
    }

    #[test]
    fn test_categories() {
        let err: Error = VerifyError::SignatureInvalid.into();
        assert_eq!(err.category(), ErrorCategory::Verification);
        let err: Error = ParseError::UnknownTag.into();
        assert_eq!(err.category(), ErrorCategory::Format);
        let err = Error::SelectionOverflow {
            index: 9,
            select_size: 1,
        };
        assert_eq!(err.category(), ErrorCategory::Compatibility);
    }
}
