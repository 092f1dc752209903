// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 OIAP authorization sessions

use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::constants::*;
use crate::device::*;
use crate::error::HardwareError;

type HmacSha1 = Hmac<Sha1>;

/// Size of the authorization trailer at the end of an auth1 response:
/// nonceEven (20) + continueAuthSession (1) + resAuth (20)
pub const RESPONSE_AUTH_SIZE: usize = NONCE_SIZE + 1 + AUTH_DATA_SIZE;

/// Object-independent authorization session
#[derive(Debug)]
pub struct OiapSession {
    pub handle: u32,
    nonce_even: [u8; NONCE_SIZE],
}

/// Authorization values sent with one command
#[derive(Debug, Clone)]
pub struct CommandAuth {
    pub nonce_odd: [u8; NONCE_SIZE],
    pub continue_session: bool,
    pub auth: [u8; AUTH_DATA_SIZE],
}

impl OiapSession {
    /// Start a new OIAP session
    pub fn start<T: TpmTransport + ?Sized>(device: &mut T) -> Result<Self, HardwareError> {
        const OP: &str = "starting OIAP session";

        let cmd = TpmCommand::new(TpmOrd::Oiap);
        let response = device.execute(&cmd.finalize(), OP)?;
        response.ensure_success(OP)?;

        let mut buf = response.data_buffer();
        let handle = buf.get_u32().map_err(protocol_error(OP))?;
        let nonce_even = buf.get_array().map_err(protocol_error(OP))?;
        debug!("started OIAP session 0x{handle:08x}");

        Ok(Self { handle, nonce_even })
    }

    /// Append the authorization trailer for `cmd` and return what was sent
    ///
    /// The session is not continued; the TPM releases it once it processes the command.
    pub fn authorize(&self, cmd: &mut TpmCommand, secret: &[u8; AUTH_DATA_SIZE]) -> CommandAuth {
        let mut nonce_odd = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_odd);
        let continue_session = false;

        let auth = auth_hmac(
            secret,
            &cmd.param_digest(),
            &self.nonce_even,
            &nonce_odd,
            continue_session,
        );

        cmd.add_u32(self.handle);
        cmd.add_bytes(&nonce_odd);
        cmd.add_u8(continue_session as u8);
        cmd.add_bytes(&auth);

        CommandAuth {
            nonce_odd,
            continue_session,
            auth,
        }
    }

    /// Check the response HMAC and return the output parameters preceding it
    pub fn verify_response<'r>(
        &self,
        operation: &'static str,
        ordinal: TpmOrd,
        response: &'r TpmResponse,
        sent: &CommandAuth,
        secret: &[u8; AUTH_DATA_SIZE],
    ) -> Result<&'r [u8], HardwareError> {
        let data = &response.data;
        if response.tag != TpmTag::RspAuth1Command || data.len() < RESPONSE_AUTH_SIZE {
            return Err(HardwareError::protocol(
                operation,
                "response lacks an authorization trailer",
            ));
        }
        let (out_params, trailer) = data.split_at(data.len() - RESPONSE_AUTH_SIZE);
        let nonce_even = &trailer[..NONCE_SIZE];
        let continue_session = trailer[NONCE_SIZE] != 0;
        let res_auth = &trailer[NONCE_SIZE + 1..];

        let mut sha = Sha1::new();
        sha.update(response.return_code.to_be_bytes());
        sha.update(ordinal.to_u32().to_be_bytes());
        sha.update(out_params);
        let out_digest: [u8; DIGEST_SIZE] = sha.finalize().into();

        let mut mac = new_hmac(secret);
        mac.update(&out_digest);
        mac.update(nonce_even);
        mac.update(&sent.nonce_odd);
        mac.update(&[continue_session as u8]);
        mac.verify_slice(res_auth)
            .map_err(|_| HardwareError::protocol(operation, "response authorization mismatch"))?;

        Ok(out_params)
    }

    /// Flush (close) this session
    pub fn flush<T: TpmTransport + ?Sized>(self, device: &mut T) -> Result<(), HardwareError> {
        flush_specific(device, self.handle, tpm_rt::AUTH)
    }
}

/// Release a TPM resource
pub fn flush_specific<T: TpmTransport + ?Sized>(
    device: &mut T,
    handle: u32,
    resource_type: u32,
) -> Result<(), HardwareError> {
    const OP: &str = "flushing TPM resource";

    let mut cmd = TpmCommand::new(TpmOrd::FlushSpecific);
    cmd.add_u32(handle);
    cmd.add_u32(resource_type);

    let response = device.execute(&cmd.finalize(), OP)?;
    response.ensure_success(OP)?;
    debug!("flushed handle 0x{handle:08x}");
    Ok(())
}

fn new_hmac(secret: &[u8; AUTH_DATA_SIZE]) -> HmacSha1 {
    // Keys shorter than the SHA-1 block are zero padded by HMAC
    let mut key = [0u8; 64];
    key[..AUTH_DATA_SIZE].copy_from_slice(secret);
    <HmacSha1 as KeyInit>::new(Key::<HmacSha1>::from_slice(&key))
}

/// HMAC-SHA1(secret, paramDigest || nonceEven || nonceOdd || continueAuthSession)
pub fn auth_hmac(
    secret: &[u8; AUTH_DATA_SIZE],
    param_digest: &[u8; DIGEST_SIZE],
    nonce_even: &[u8; NONCE_SIZE],
    nonce_odd: &[u8; NONCE_SIZE],
    continue_session: bool,
) -> [u8; AUTH_DATA_SIZE] {
    let mut mac = new_hmac(secret);
    mac.update(param_digest);
    mac.update(nonce_even);
    mac.update(nonce_odd);
    mac.update(&[continue_session as u8]);
    mac.finalize().into_bytes().into()
}
