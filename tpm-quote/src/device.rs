// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! Provides TPM 1.2 command framing and raw I/O with `/dev/tpm0`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::constants::*;
use crate::error::{HardwareError, ParseError};
use crate::marshal::*;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Size of the common header: tag (2) + size (4) + ordinal or return code (4)
pub const TPM_HEADER_SIZE: usize = 10;

/// Character device of a TPM 1.2 chip; there is no resource-manager node
const DEFAULT_DEVICE: &str = "/dev/tpm0";

/// Anything that can carry a marshalled TPM command and return the response
pub trait TpmTransport {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>>;

    /// Send a command and parse the response header
    fn execute(&mut self, command: &[u8], operation: &'static str) -> Result<TpmResponse, HardwareError> {
        let response = self
            .transmit(command)
            .map_err(|err| HardwareError::io(operation, err))?;
        TpmResponse::parse(&response).map_err(protocol_error(operation))
    }
}

/// Map a decode failure of a TPM response to a hardware error
pub(crate) fn protocol_error(operation: &'static str) -> impl Fn(ParseError) -> HardwareError {
    move |err| HardwareError::protocol(operation, err.to_string())
}

/// TPM character device handle
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str) -> Result<Self, HardwareError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| HardwareError::io("opening TPM device", err))?;
        debug!("opened TPM device {path}");
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self, HardwareError> {
        if !Path::new(DEFAULT_DEVICE).exists() {
            return Err(HardwareError::io(
                "opening TPM device",
                io::Error::new(io::ErrorKind::NotFound, "TPM device not found"),
            ));
        }
        Self::open(DEFAULT_DEVICE)
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl TpmTransport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        self.file.write_all(command)?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self.file.read(&mut response)?;

        response.truncate(n);
        Ok(response)
    }
}

/// TPM 1.2 command builder
///
/// Handles are added first with [`TpmCommand::add_handle`], which moves the
/// start of the authorized parameters past them, so the parameter digest
/// covers the ordinal and everything after the handles.
pub struct TpmCommand {
    ordinal: TpmOrd,
    buf: CommandBuffer,
    params_start: usize,
}

impl TpmCommand {
    fn with_tag(tag: TpmTag, ordinal: TpmOrd) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + ordinal (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(ordinal.to_u32());

        Self {
            ordinal,
            buf,
            params_start: TPM_HEADER_SIZE,
        }
    }

    /// Create a new command without authorization
    pub fn new(ordinal: TpmOrd) -> Self {
        Self::with_tag(TpmTag::RquCommand, ordinal)
    }

    /// Create a new command carrying one authorization session
    pub fn with_auth1(ordinal: TpmOrd) -> Self {
        Self::with_tag(TpmTag::RquAuth1Command, ordinal)
    }

    pub fn ordinal(&self) -> TpmOrd {
        self.ordinal
    }

    /// Add a key or session handle
    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
        self.params_start = self.buf.len();
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// SHA1(ordinal || params), the input parameter digest for authorization
    pub fn param_digest(&self) -> [u8; DIGEST_SIZE] {
        let mut sha = Sha1::new();
        sha.update(self.ordinal.to_u32().to_be_bytes());
        sha.update(&self.buf.as_bytes()[self.params_start..]);
        sha.finalize().into()
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmTag,
    pub return_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self, ParseError> {
        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmTag::from_u16(tag_raw)
            .filter(|t| matches!(t, TpmTag::RspCommand | TpmTag::RspAuth1Command))
            .ok_or_else(|| ParseError::Invalid(format!("invalid response tag: 0x{tag_raw:04x}")))?;

        let size = buf.get_u32()? as usize;
        let return_code = buf.get_u32()?;
        if size < TPM_HEADER_SIZE || response.len() < size {
            return Err(ParseError::LengthMismatch {
                expected: size,
                actual: response.len(),
            });
        }

        Ok(Self {
            tag,
            return_code,
            data: response[TPM_HEADER_SIZE..size].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.return_code == TPM_SUCCESS
    }

    /// Ensure the response is successful
    pub fn ensure_success(&self, operation: &'static str) -> Result<(), HardwareError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(HardwareError::tpm(operation, self.return_code))
        }
    }

    /// Get a response buffer for parsing the data
    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }
}
