// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 command implementations
//!
//! This module provides the high-level TPM operations used for attestation.

use tracing::debug;

use crate::constants::*;
use crate::device::*;
use crate::error::HardwareError;
use crate::marshal::*;
use crate::quote::{ExtendedQuote, LegacyQuote, QuoteKey, TrustModule};
use crate::session::*;
use crate::types::*;

/// Pure Rust TPM 1.2 context
pub struct TpmContext<T = TpmDevice> {
    device: T,
}

impl TpmContext<TpmDevice> {
    /// Create a new TPM context with the given device path, or auto-detect one
    pub fn new(device_path: Option<&str>) -> Result<Self, HardwareError> {
        let device = match device_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };
        Ok(Self { device })
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.device.path()
    }
}

impl<T: TpmTransport> TpmContext<T> {
    /// Wrap an already opened transport
    pub fn with_transport(device: T) -> Self {
        Self { device }
    }

    pub fn transport(&self) -> &T {
        &self.device
    }

    // ==================== PCR Operations ====================

    /// Number of PCRs the TPM implements (TPM_CAP_PROP_PCR)
    pub fn get_pcr_count(&mut self) -> Result<u32, HardwareError> {
        const OP: &str = "getting number of PCRs";

        let mut cmd = TpmCommand::new(TpmOrd::GetCapability);
        cmd.add_u32(tpm_cap::PROPERTY);
        cmd.add_u32(4); // subCapSize
        cmd.add_u32(tpm_cap::PROP_PCR);

        let response = self.device.execute(&cmd.finalize(), OP)?;
        response.ensure_success(OP)?;

        let mut buf = response.data_buffer();
        let resp = buf.get_sized().map_err(protocol_error(OP))?;
        let count = u32::from_bytes(&resp).map_err(protocol_error(OP))?;
        debug!("TPM reports {count} PCRs");
        Ok(count)
    }

    /// Read a single PCR
    pub fn pcr_read(&mut self, index: u32) -> Result<PcrValue, HardwareError> {
        const OP: &str = "reading PCR";

        let mut cmd = TpmCommand::new(TpmOrd::PcrRead);
        cmd.add_u32(index);

        let response = self.device.execute(&cmd.finalize(), OP)?;
        response.ensure_success(OP)?;

        let mut buf = response.data_buffer();
        Ok(PcrValue(buf.get_array().map_err(protocol_error(OP))?))
    }

    // ==================== Attestation ====================

    /// TPM_Quote: sign the composite hash of `selection` together with `nonce`
    pub fn quote(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<LegacyQuote, HardwareError> {
        const OP: &str = "performing quote";

        let mut cmd = TpmCommand::with_auth1(TpmOrd::Quote);
        // keyHandle
        cmd.add_handle(key.handle);
        // externalData
        cmd.add(nonce);
        // targetPCR
        cmd.add(selection);

        let out = self.execute_authorized(OP, cmd, &key.usage_secret)?;
        let mut buf = ResponseBuffer::new(&out);
        let pcr_data = PcrComposite::unmarshal(&mut buf).map_err(protocol_error(OP))?;
        let signature = buf.get_sized().map_err(protocol_error(OP))?;

        debug!("generated TPM quote over {} PCRs", pcr_data.pcr_values.len());
        Ok(LegacyQuote {
            pcr_data,
            signature,
        })
    }

    /// TPM_Quote2: sign a TPM_QUOTE_INFO2 for `selection` and `nonce`
    pub fn quote2(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<ExtendedQuote, HardwareError> {
        const OP: &str = "performing quote2";

        let mut cmd = TpmCommand::with_auth1(TpmOrd::Quote2);
        // keyHandle
        cmd.add_handle(key.handle);
        // externalData
        cmd.add(nonce);
        // targetPCR
        cmd.add(selection);
        // addVersion
        cmd.add_u8(0);

        let out = self.execute_authorized(OP, cmd, &key.usage_secret)?;
        let mut buf = ResponseBuffer::new(&out);
        let pcr_data = PcrInfoShort::unmarshal(&mut buf).map_err(protocol_error(OP))?;
        let version_info = buf.get_sized().map_err(protocol_error(OP))?;
        let signature = buf.get_sized().map_err(protocol_error(OP))?;

        debug!("generated TPM quote2");
        Ok(ExtendedQuote {
            pcr_data,
            version_info,
            signature,
        })
    }

    /// Release a TPM resource
    pub fn flush_specific(&mut self, handle: u32, resource_type: u32) -> Result<(), HardwareError> {
        flush_specific(&mut self.device, handle, resource_type)
    }

    /// Run `cmd` under a fresh OIAP session and return the verified output parameters
    fn execute_authorized(
        &mut self,
        operation: &'static str,
        mut cmd: TpmCommand,
        secret: &[u8; AUTH_DATA_SIZE],
    ) -> Result<Vec<u8>, HardwareError> {
        let session = OiapSession::start(&mut self.device)?;
        let ordinal = cmd.ordinal();
        let sent = session.authorize(&mut cmd, secret);

        let response = match self.device.execute(&cmd.finalize(), operation) {
            Ok(response) => response,
            Err(err) => {
                // The TPM may never have seen the command
                if let Err(flush_err) = session.flush(&mut self.device) {
                    debug!("failed to flush OIAP session: {flush_err}");
                }
                return Err(err);
            }
        };
        response.ensure_success(operation)?;

        let out = session.verify_response(operation, ordinal, &response, &sent, secret)?;
        Ok(out.to_vec())
    }
}

impl<T: TpmTransport> TrustModule for TpmContext<T> {
    fn pcr_count(&mut self) -> Result<u32, HardwareError> {
        self.get_pcr_count()
    }

    fn pcr_read(&mut self, index: u32) -> Result<PcrValue, HardwareError> {
        TpmContext::pcr_read(self, index)
    }

    fn quote(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<LegacyQuote, HardwareError> {
        TpmContext::quote(self, key, nonce, selection)
    }

    fn quote2(
        &mut self,
        key: &QuoteKey,
        nonce: &Nonce,
        selection: &PcrSelection,
    ) -> Result<ExtendedQuote, HardwareError> {
        TpmContext::quote2(self, key, nonce, selection)
    }
}
