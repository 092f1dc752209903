// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use fs_err as fs;
use tpm_quote::{
    verify_quote, AikPublicKey, DecodeOptions, Error, ErrorCategory, HardwareError, HashUpdater,
    InputError, ParseError, QuoteInfo, QuoteKey, QuoteService, TpmContext, TrustModule,
    UpdateOptions, VerifyError, AUTH_DATA_SIZE, DEFAULT_MAX_SELECT_SIZE,
};
use tracing::{error, info};

/// TPM 1.2 PCR quote utility
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TPM device node (default: /dev/tpm0)
    #[arg(long, global = true, env = "TPM_QUOTE_DEVICE")]
    device: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Quote PCRs with a nonce read from a file
    Quote(QuoteArgs),
    /// Quote PCRs with a random nonce and save the quote info and PCR values
    PcrHash(PcrHashArgs),
    /// Recompute the composite hash of a quote info for new PCR values
    UpdateHash(UpdateHashArgs),
    /// Verify a quote signature against an expected quote info and nonce
    Verify(VerifyArgs),
    /// Print a decoded quote info as JSON
    Inspect(InspectArgs),
}

#[derive(Args)]
struct KeyArgs {
    /// handle of the loaded quoting key, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_handle)]
    key_handle: u32,

    /// hex encoded usage secret of the key (default: well-known secret)
    #[arg(long, value_parser = parse_secret)]
    key_secret: Option<[u8; AUTH_DATA_SIZE]>,
}

impl KeyArgs {
    fn quote_key(&self) -> QuoteKey {
        let mut key = QuoteKey::well_known(self.key_handle);
        if let Some(secret) = self.key_secret {
            key.usage_secret = secret;
        }
        key
    }
}

#[derive(Parser)]
/// Quote PCRs
struct QuoteArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// file holding the 20 byte nonce
    nonce: PathBuf,

    /// file to store the signature
    signature: PathBuf,

    /// PCRs to quote
    #[arg(required = true)]
    pcrs: Vec<u32>,

    /// file to store the signed quote info
    #[arg(long)]
    quote_info: Option<PathBuf>,

    /// file to store the quoted PCR values as index=HEX lines
    #[arg(short, long)]
    pcr_values: Option<PathBuf>,
}

#[derive(Parser)]
/// Quote PCRs with a random nonce
struct PcrHashArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// file to store the quote info
    hash: PathBuf,

    /// file to store the quoted PCR values as index=HEX lines
    pcr_values: PathBuf,

    /// PCRs to quote
    #[arg(required = true)]
    pcrs: Vec<u32>,
}

#[derive(Parser)]
/// Update a quote info for new PCR values
struct UpdateHashArgs {
    /// file containing the old quote info
    old_hash: PathBuf,

    /// file containing index=HEX lines for the new PCR values
    new_pcr_values: PathBuf,

    /// file to store the updated quote info
    new_hash: PathBuf,

    /// largest PCR selection, in bytes, accepted in the old quote info
    #[arg(long, default_value_t = DEFAULT_MAX_SELECT_SIZE)]
    max_select_size: usize,
}

#[derive(Parser)]
/// Verify a quote
struct VerifyArgs {
    /// DER encoded public key (SubjectPublicKeyInfo, PKCS#1 or TSS blob)
    pubkey: PathBuf,

    /// file containing the expected quote info
    hash: PathBuf,

    /// file holding the 20 byte nonce
    nonce: PathBuf,

    /// file holding the signature (default: stdin)
    signature: Option<PathBuf>,
}

#[derive(Parser)]
/// Decode a quote info
struct InspectArgs {
    /// file containing the quote info
    hash: PathBuf,

    /// largest PCR selection, in bytes, accepted
    #[arg(long, default_value_t = DEFAULT_MAX_SELECT_SIZE)]
    max_select_size: usize,
}

fn parse_handle(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid key handle {s}: {e}"))
}

fn parse_secret(s: &str) -> Result<[u8; AUTH_DATA_SIZE], String> {
    let mut secret = [0u8; AUTH_DATA_SIZE];
    hex::decode_to_slice(s, &mut secret)
        .map_err(|e| format!("key secret must be {} hex digits: {e}", 2 * AUTH_DATA_SIZE))?;
    Ok(secret)
}

/// Output files written to temporaries next to their destinations
///
/// Nothing becomes visible until [`Outputs::commit`], which renames every
/// staged file into place. Dropping without committing removes them.
#[derive(Default)]
struct Outputs {
    staged: Vec<(tempfile::NamedTempFile, PathBuf)>,
}

impl Outputs {
    fn stage(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        tmp.write_all(data)
            .context("Failed to write temporary file")?;
        tmp.as_file_mut()
            .sync_all()
            .context("Failed to flush temporary file to disk")?;
        self.staged.push((tmp, path.to_path_buf()));
        Ok(())
    }

    fn commit(self) -> Result<()> {
        for (tmp, path) in self.staged {
            tmp.persist(&path)
                .map_err(|e| anyhow!("Failed to persist {}: {e}", path.display()))?;
        }
        Ok(())
    }
}

/// Write a single file through a temporary in the same directory
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut out = Outputs::default();
    out.stage(path, data)?;
    out.commit()
}

fn cmd_quote(tpm: &mut impl TrustModule, args: QuoteArgs) -> Result<()> {
    let nonce = fs::read(&args.nonce).context("Failed to read nonce")?;
    let mut service = QuoteService::new(tpm, args.key.quote_key());
    let signed = service.quote(&args.pcrs, &nonce)?;
    let values = match args.pcr_values {
        Some(_) => Some(service.pcr_values(&args.pcrs)?),
        None => None,
    };

    let mut out = Outputs::default();
    out.stage(&args.signature, &signed.signature)?;
    if let Some(path) = &args.quote_info {
        out.stage(path, &signed.quote_info)?;
    }
    if let (Some(path), Some(values)) = (&args.pcr_values, values) {
        out.stage(path, values.to_text().as_bytes())?;
    }
    out.commit()?;
    info!(
        "wrote {} byte signature over {} quote info",
        signed.signature.len(),
        signed.format.as_str()
    );
    Ok(())
}

fn cmd_pcr_hash(tpm: &mut impl TrustModule, args: PcrHashArgs) -> Result<()> {
    let (signed, values) =
        QuoteService::new(tpm, args.key.quote_key()).pcr_hash(&args.pcrs)?;
    let mut out = Outputs::default();
    out.stage(&args.hash, &signed.quote_info)?;
    out.stage(&args.pcr_values, values.to_text().as_bytes())?;
    out.commit()
}

fn cmd_update_hash(args: UpdateHashArgs) -> Result<()> {
    let old = fs::read(&args.old_hash).context("Failed to read old hash")?;
    let new_values =
        fs::read_to_string(&args.new_pcr_values).context("Failed to read new PCR values")?;
    let updater = HashUpdater::new(UpdateOptions {
        max_select_size: args.max_select_size,
    });
    let new = updater.update_from_text(&old, &new_values)?;
    write_atomic(&args.new_hash, &new)?;
    info!("wrote updated hash to {}", args.new_hash.display());
    Ok(())
}

fn cmd_verify(args: VerifyArgs) -> Result<()> {
    let pubkey = fs::read(&args.pubkey).context("Failed to read public key")?;
    let hash = fs::read(&args.hash).context("Failed to read hash")?;
    let nonce = fs::read(&args.nonce).context("Failed to read nonce")?;
    let signature = match &args.signature {
        Some(path) => fs::read(path).context("Failed to read signature")?,
        None => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read signature from stdin")?;
            buf
        }
    };

    let key = AikPublicKey::from_der(&pubkey)?;
    verify_quote(&key, &hash, &nonce, &signature)?;
    info!("quote verified");
    Ok(())
}

fn cmd_inspect(args: InspectArgs, out: &mut impl Write) -> Result<()> {
    let bytes = fs::read(&args.hash).context("Failed to read hash")?;
    let opts = DecodeOptions {
        max_select_size: args.max_select_size,
    };
    let info = QuoteInfo::decode_with(&bytes, &opts)?;
    serde_json::to_writer_pretty(&mut *out, &info.summary())
        .context("Failed to write quote info")?;
    writeln!(out)?;
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let open_tpm = || -> Result<TpmContext> {
        let ctx = TpmContext::new(cli.device.as_deref())?;
        info!("using TPM device {}", ctx.device_path());
        Ok(ctx)
    };
    match cli.command {
        Commands::Quote(args) => cmd_quote(&mut open_tpm()?, args),
        Commands::PcrHash(args) => cmd_pcr_hash(&mut open_tpm()?, args),
        Commands::UpdateHash(args) => cmd_update_hash(args),
        Commands::Verify(args) => cmd_verify(args),
        Commands::Inspect(args) => cmd_inspect(args, &mut io::stdout().lock()),
    }
}

/// Classify the first library error in the chain
fn error_category(err: &anyhow::Error) -> Option<ErrorCategory> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<Error>() {
            Some(e.category())
        } else if let Some(e) = cause.downcast_ref::<VerifyError>() {
            Some(Error::from(e.clone()).category())
        } else if cause.is::<HardwareError>() {
            Some(ErrorCategory::Hardware)
        } else if cause.is::<ParseError>() {
            Some(ErrorCategory::Format)
        } else if cause.is::<InputError>() {
            Some(ErrorCategory::Input)
        } else {
            None
        }
    })
}

fn exit_status(category: Option<ErrorCategory>) -> u8 {
    match category {
        Some(ErrorCategory::Format) => 2,
        Some(ErrorCategory::Input) => 3,
        Some(ErrorCategory::Compatibility) => 4,
        Some(ErrorCategory::Hardware) => 5,
        Some(ErrorCategory::Verification) => 6,
        None => 1,
    }
}

fn main() -> ExitCode {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(io::stderr).init();
    }

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let category = error_category(&err);
            match category {
                Some(category) => error!("{category}: {err:#}"),
                None => error!("{err:#}"),
            }
            ExitCode::from(exit_status(category))
        }
    }
}
