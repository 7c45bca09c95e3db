use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use provcert_core::{
    config::{LoggingConfig, ProvcertConfig},
    ledger::{self, Ledger, LedgerPolicy},
    signing::{self, Secp256k1Signer, Signer as _},
    util, ProvcertError,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "provcert",
    version = util::VERSION,
    about = "Provenance-certification ledger for supply-chain batches"
)]
struct Cli {
    /// Path to the ledger database (SQLite / SQLCipher).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Read the DB encryption key from this environment variable.
    #[arg(long, global = true, default_value = "PROVCERT_DB_KEY")]
    db_key_env: String,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity submitting mutating calls (defaults to the configured admin).
    #[arg(long, global = true)]
    caller: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty ledger database.
    InitLedger,

    /// Generate a secp256k1 signing key and print its identity.
    Keygen {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Print the identity of a signing key.
    Identity {
        #[arg(long)]
        signing_key_pem: PathBuf,
    },

    /// Register an entity with a fixed mode (ISSUER, PROVER, VERIFIER).
    AddEntity {
        #[arg(long)]
        id: String,
        #[arg(long)]
        mode: String,
    },

    /// Register a batch held by a custodian entity.
    AddBatch {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        custodian: String,
    },

    /// Print the canonical attestation hash for the given fields.
    MessageHash {
        #[arg(long)]
        issuer: String,
        #[arg(long)]
        batch_id: u64,
        #[arg(long)]
        prover: String,
        #[arg(long)]
        status: String,
    },

    /// Sign an attestation off-ledger with an issuer's key.
    Sign {
        #[arg(long)]
        signing_key_pem: PathBuf,
        #[arg(long)]
        batch_id: u64,
        #[arg(long)]
        prover: String,
        #[arg(long)]
        status: String,
    },

    /// Record a signed certificate.
    IssueCertificate {
        #[arg(long)]
        issuer: String,
        #[arg(long)]
        prover: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        batch_id: u64,
        /// Base64-encoded recoverable signature.
        #[arg(long)]
        signature_b64: String,
    },

    ShowEntity {
        #[arg(long)]
        id: String,
    },

    ShowBatch {
        #[arg(long)]
        id: u64,
    },

    ShowCertificate {
        #[arg(long)]
        id: u64,
    },

    /// Check whether a claimed identity signed a stored certificate.
    VerifySignature {
        #[arg(long)]
        certificate_id: u64,
        #[arg(long)]
        claimed_signer: String,
        /// Hex message hash; defaults to the certificate's canonical hash.
        #[arg(long)]
        message_hash: Option<String>,
    },

    /// Verify the event journal's hash chain.
    VerifyJournal,

    /// Export the ledger to a JSON snapshot.
    ExportLedger {
        #[arg(long)]
        out: PathBuf,
    },

    /// Print version information.
    Version,
}

#[derive(Debug, Serialize)]
struct SignOutput {
    identity: String,
    message_hash: String,
    signature_b64: String,
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    certificate_id: u64,
    claimed_signer: String,
    message_hash: String,
    matches: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        let code = err
            .downcast_ref::<ProvcertError>()
            .map(|e| e.class().exit_code())
            .unwrap_or(1);
        eprintln!("error: {err:#}");
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = ProvcertConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env();

    init_logging(&cfg.logging).context("init logging")?;

    let policy = LedgerPolicy::from_deployment(&cfg.deployment).context("deployment config")?;
    let caller = cli
        .caller
        .clone()
        .or(cfg.deployment.admin_id.clone())
        .unwrap_or_else(|| "local".to_string());

    let db_path = cli.db.clone().unwrap_or(cfg.paths.db.clone());
    util::validate_path(&db_path, "db")?;
    let db_key = std::env::var(&cli.db_key_env)
        .ok()
        .or(cfg.security.db_key.clone())
        .map(|s| SecretString::new(s.into()));

    let open = |policy: LedgerPolicy| -> Result<Ledger> {
        Ledger::open_existing(&db_path, db_key.as_ref(), policy).context("open ledger")
    };

    match cli.cmd {
        Commands::InitLedger => {
            let ledger = Ledger::create_new(&db_path, db_key.as_ref(), policy)
                .context("create ledger")?;
            info!(ledger_id = %ledger.meta().ledger_id, "ledger initialized");
        }

        Commands::Keygen { out_dir } => {
            let out_dir = out_dir.unwrap_or(cfg.paths.keys_dir.clone());
            let identity = signing::keygen_secp256k1(&out_dir).context("keygen")?;
            info!(out_dir = %out_dir.display(), "generated signing_key.pem and identity.txt");
            println!("{identity}");
        }

        Commands::Identity { signing_key_pem } => {
            let signer = load_signer(&signing_key_pem)?;
            println!("{}", signer.identity());
        }

        Commands::AddEntity { id, mode } => {
            let mut ledger = open(policy)?;
            let entity = ledger
                .add_entity_str(&caller, &id, &mode)
                .context("add entity")?;
            print_json(&entity)?;
        }

        Commands::AddBatch { origin, custodian } => {
            let mut ledger = open(policy)?;
            let batch_id = ledger
                .add_batch(&caller, &origin, &custodian)
                .context("add batch")?;
            print_json(&ledger.get_batch(batch_id)?)?;
        }

        Commands::MessageHash {
            issuer,
            batch_id,
            prover,
            status,
        } => {
            let hash = signing::attestation_hash(&issuer, batch_id, &prover, &status);
            println!("{}", hex::encode(hash));
        }

        Commands::Sign {
            signing_key_pem,
            batch_id,
            prover,
            status,
        } => {
            let signer = load_signer(&signing_key_pem)?;
            let hash = signing::attestation_hash(signer.identity(), batch_id, &prover, &status);
            let signature = signer.sign_prehash(&hash).context("sign attestation")?;
            print_json(&SignOutput {
                identity: signer.descriptor().identity.clone(),
                message_hash: hex::encode(hash),
                signature_b64: util::b64_encode(&signature),
            })?;
        }

        Commands::IssueCertificate {
            issuer,
            prover,
            status,
            batch_id,
            signature_b64,
        } => {
            let signature = util::b64_decode(&signature_b64).context("decode signature")?;
            let mut ledger = open(policy)?;
            let certificate_id = ledger
                .issue_certificate(&caller, &issuer, &prover, &status, batch_id, &signature)
                .context("issue certificate")?;
            print_json(&ledger.get_certificate(certificate_id)?)?;
        }

        Commands::ShowEntity { id } => {
            print_json(&open(policy)?.get_entity(&id)?)?;
        }

        Commands::ShowBatch { id } => {
            print_json(&open(policy)?.get_batch(id)?)?;
        }

        Commands::ShowCertificate { id } => {
            print_json(&open(policy)?.get_certificate(id)?)?;
        }

        Commands::VerifySignature {
            certificate_id,
            claimed_signer,
            message_hash,
        } => {
            let ledger = open(policy)?;
            let hash = match message_hash {
                Some(h) => util::parse_hash_hex(&h)?,
                None => ledger.get_certificate(certificate_id)?.canonical_hash(),
            };
            let matches = ledger
                .is_matching_signature(&hash, certificate_id, &claimed_signer)
                .context("verify signature")?;
            print_json(&VerifyOutput {
                certificate_id,
                claimed_signer,
                message_hash: hex::encode(hash),
                matches,
            })?;
            if !matches {
                warn!(certificate_id, "claimed signer did not produce this signature");
                std::process::exit(1);
            }
        }

        Commands::VerifyJournal => {
            let ledger = open(policy)?;
            let meta = ledger.meta().clone();
            info!(ledger_id = %meta.ledger_id, schema_version = meta.schema_version, "verifying");
            let count = ledger.verify_journal().context("verify journal")?;
            info!(entries = count, "journal verification passed");
        }

        Commands::ExportLedger { out } => {
            let ledger = open(policy)?;
            ledger::export_ledger_json(&ledger, &out).context("export ledger")?;
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_signer(path: &Path) -> Result<Secp256k1Signer> {
    let path = util::canonicalize_if_exists(path, "signing key")?;
    Secp256k1Signer::from_key_pem(&path).context("load signer")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .with_context(|| format!("open json log file {}", cfg.json_log_file))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(file_layer).with(console_layer).init();
    } else {
        // Default: human-readable output to stderr; stdout carries results.
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
    Ok(())
}
