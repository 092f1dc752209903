// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 constants, ordinals and structure sizes

/// Size of a SHA-1 digest (TPM_DIGEST, TPM_COMPOSITE_HASH)
pub const DIGEST_SIZE: usize = 20;
/// Size of a TPM_NONCE
pub const NONCE_SIZE: usize = 20;
/// Size of a single PCR register value
pub const PCR_VALUE_SIZE: usize = 20;
/// Size of an OIAP HMAC (TPM_AUTHDATA)
pub const AUTH_DATA_SIZE: usize = 20;

/// Fixed tag of TPM_QUOTE_INFO
pub const QUOTE_INFO_FIXED: [u8; 4] = *b"QUOT";
/// Fixed tag of TPM_QUOTE_INFO2
pub const QUOTE_INFO2_FIXED: [u8; 4] = *b"QUT2";
/// TPM_STRUCT_VER carried by every TPM_QUOTE_INFO
pub const QUOTE_INFO_VERSION: [u8; 4] = [1, 1, 0, 0];
/// TPM_TAG_QUOTE_INFO2 structure tag
pub const TPM_TAG_QUOTE_INFO2: u16 = 0x0036;

/// Offset of the fixed tag inside TPM_QUOTE_INFO (after TPM_STRUCT_VER)
pub const QUOTE_INFO_FIXED_OFFSET: usize = 4;
/// Offset of the fixed tag inside TPM_QUOTE_INFO2 (after TPM_STRUCTURE_TAG)
pub const QUOTE_INFO2_FIXED_OFFSET: usize = 2;
/// Serialized size of TPM_QUOTE_INFO
pub const LEGACY_QUOTE_INFO_SIZE: usize = 4 + 4 + DIGEST_SIZE + NONCE_SIZE;
/// Select size implied by a legacy quote (PCRs 0-15)
pub const LEGACY_SELECT_SIZE: usize = 2;
/// Largest selection the hash updater accepts by default (PCRs 0-23)
pub const DEFAULT_MAX_SELECT_SIZE: usize = 3;

/// Usage secret of keys created with the well-known secret
pub const WELL_KNOWN_SECRET: [u8; AUTH_DATA_SIZE] = [0u8; AUTH_DATA_SIZE];

/// TPM 1.2 command ordinals (TPM_COMMAND_CODE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmOrd {
    Oiap = 0x0000000A,
    PcrRead = 0x00000015,
    Quote = 0x00000016,
    Quote2 = 0x0000003E,
    GetCapability = 0x00000065,
    FlushSpecific = 0x000000BA,
}

impl TpmOrd {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 1.2 command and response tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmTag {
    RquCommand = 0x00C1,
    RquAuth1Command = 0x00C2,
    RspCommand = 0x00C4,
    RspAuth1Command = 0x00C5,
}

impl TpmTag {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C1 => Some(TpmTag::RquCommand),
            0x00C2 => Some(TpmTag::RquAuth1Command),
            0x00C4 => Some(TpmTag::RspCommand),
            0x00C5 => Some(TpmTag::RspAuth1Command),
            _ => None,
        }
    }
}

/// TPM_GetCapability areas and sub-capabilities
pub mod tpm_cap {
    pub const PROPERTY: u32 = 0x00000005;
    pub const PROP_PCR: u32 = 0x00000101;
}

/// TPM_RESOURCE_TYPE values for FlushSpecific
pub mod tpm_rt {
    pub const AUTH: u32 = 0x00000002;
}

/// TPM_ALGORITHM_ID values
pub mod tpm_alg {
    pub const RSA: u32 = 0x00000001;
}

/// TSS blob types carried in DER-encoded key containers
pub mod tss_blob {
    pub const STRUCT_VERSION: u32 = 1;
    pub const PUBKEY: u32 = 2;
}

/// TPM 1.2 return code for a successful command
pub const TPM_SUCCESS: u32 = 0;

/// Bit marking a non-fatal return code (TPM_NON_FATAL)
const TPM_NON_FATAL: u32 = 0x00000800;

/// Look up the symbolic name of a TPM 1.2 return code
pub fn tpm_rc_name(code: u32) -> Option<&'static str> {
    let name = match code {
        TPM_SUCCESS => "TPM_SUCCESS",
        1 => "TPM_AUTHFAIL",
        2 => "TPM_BADINDEX",
        3 => "TPM_BAD_PARAMETER",
        4 => "TPM_AUDITFAILURE",
        5 => "TPM_CLEAR_DISABLED",
        6 => "TPM_DEACTIVATED",
        7 => "TPM_DISABLED",
        8 => "TPM_DISABLED_CMD",
        9 => "TPM_FAIL",
        10 => "TPM_BAD_ORDINAL",
        11 => "TPM_INSTALL_DISABLED",
        12 => "TPM_INVALID_KEYHANDLE",
        13 => "TPM_KEYNOTFOUND",
        14 => "TPM_INAPPROPRIATE_ENC",
        15 => "TPM_MIGRATEFAIL",
        16 => "TPM_INVALID_PCR_INFO",
        17 => "TPM_NOSPACE",
        18 => "TPM_NOSRK",
        19 => "TPM_NOTSEALED_BLOB",
        20 => "TPM_OWNER_SET",
        21 => "TPM_RESOURCES",
        22 => "TPM_SHORTRANDOM",
        23 => "TPM_SIZE",
        24 => "TPM_WRONGPCRVAL",
        25 => "TPM_BAD_PARAM_SIZE",
        26 => "TPM_SHA_THREAD",
        27 => "TPM_SHA_ERROR",
        28 => "TPM_FAILEDSELFTEST",
        29 => "TPM_AUTH2FAIL",
        30 => "TPM_BADTAG",
        31 => "TPM_IOERROR",
        32 => "TPM_ENCRYPT_ERROR",
        33 => "TPM_DECRYPT_ERROR",
        34 => "TPM_INVALID_AUTHHANDLE",
        35 => "TPM_NO_ENDORSEMENT",
        36 => "TPM_INVALID_KEYUSAGE",
        37 => "TPM_WRONG_ENTITYTYPE",
        38 => "TPM_INVALID_POSTINIT",
        39 => "TPM_INAPPROPRIATE_SIG",
        40 => "TPM_BAD_KEY_PROPERTY",
        41 => "TPM_BAD_MIGRATION",
        42 => "TPM_BAD_SCHEME",
        43 => "TPM_BAD_DATASIZE",
        44 => "TPM_BAD_MODE",
        45 => "TPM_BAD_PRESENCE",
        46 => "TPM_BAD_VERSION",
        61 => "TPM_BAD_LOCALITY",
        c if c == TPM_NON_FATAL => "TPM_RETRY",
        c if c == TPM_NON_FATAL + 1 => "TPM_NEEDS_SELFTEST",
        c if c == TPM_NON_FATAL + 2 => "TPM_DOING_SELFTEST",
        c if c == TPM_NON_FATAL + 3 => "TPM_DEFEND_LOCK_RUNNING",
        _ => return None,
    };
    Some(name)
}
