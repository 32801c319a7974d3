//! Operator CLI. Results go to stdout, logs to stderr. Key material and the
//! admin token are only ever read from the environment or key files, never
//! from arguments, so they stay out of shell history.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::{error, warn};

use phi_guard::admin::{AdminConsole, AdminToken};
use phi_guard::audit::{AuditCodec, AuditTrail};
use phi_guard::config::{default_config_path, load_config, GuardConfig};
use phi_guard::crypto::integrity::sha256_hex;
use phi_guard::crypto::{Algorithm, EncryptionEngine, KeyType};
use phi_guard::lockout::{AttemptStore, AttemptTracker, JsonFileStore, MemoryStore};
use phi_guard::logging::init_tracing;

const ADMIN_TOKEN_ENV: &str = "PHI_GUARD_ADMIN_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "phi-guard", version, about = "Field encryption, audit sealing and login lockout")]
struct Cli {
    /// JSON config file (defaults to $PHI_GUARD_CONFIG or ./phi-guard.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AlgorithmArg {
    Cbc,
    Gcm,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Cbc => Algorithm::Cbc,
            AlgorithmArg::Gcm => Algorithm::Gcm,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt a value into a versioned ciphertext string
    Encrypt {
        plaintext: String,
        #[arg(long, default_value = "phi")]
        key_type: KeyType,
        /// Overrides the configured default algorithm
        #[arg(long, value_enum)]
        algorithm: Option<AlgorithmArg>,
    },
    /// Decrypt a ciphertext (or legacy base64) value
    Decrypt {
        ciphertext: String,
        #[arg(long, default_value = "phi")]
        key_type: KeyType,
        /// Fail instead of returning a best-effort value
        #[arg(long)]
        strict: bool,
    },
    /// Re-encrypt a legacy or CBC value as GCM
    Upgrade {
        value: String,
        #[arg(long, default_value = "phi")]
        key_type: KeyType,
    },
    /// Create a sealed audit entry; appended to the audit log when configured
    AuditCreate {
        action: String,
        resource: String,
        /// JSON object with extra details
        #[arg(long)]
        details: Option<String>,
    },
    /// Verify one sealed entry, or every entry of the configured audit log
    AuditVerify { entry: Option<String> },
    /// Show whether an identity is locked
    LockoutStatus { identity: String },
    /// Record a failed login for an identity
    LockoutRecord { identity: String },
    /// Clear failures after a successful login
    LockoutClear { identity: String },
    /// List tracked identities
    LockoutList,
    /// Remove one identity's lock (needs PHI_GUARD_ADMIN_TOKEN)
    EmergencyUnblock {
        identity: String,
        #[arg(long)]
        operator: String,
    },
    /// Remove every lock (needs PHI_GUARD_ADMIN_TOKEN)
    EmergencyClearAll {
        #[arg(long)]
        operator: String,
    },
    /// SHA-256 hex of the given text
    HashBytes { data: String },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn resolve_config(explicit: Option<PathBuf>) -> Result<GuardConfig, Box<dyn std::error::Error>> {
    match explicit {
        Some(path) => Ok(load_config(path)?),
        None => {
            let path = default_config_path();
            if path.exists() {
                Ok(load_config(path)?)
            } else {
                Ok(GuardConfig::default())
            }
        }
    }
}

fn open_tracker(config: &GuardConfig) -> Result<Arc<AttemptTracker>, Box<dyn std::error::Error>> {
    let store: Arc<dyn AttemptStore> = match &config.store_path {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => {
            warn!("no store_path configured; lockout state will not outlive this process");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(Arc::new(AttemptTracker::open(store, config.lockout.policy()?)?))
}

fn audit_codec(engine: Arc<EncryptionEngine>) -> Arc<AuditCodec> {
    Arc::new(AuditCodec::new(engine))
}

fn print_json(value: &Value) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> CliResult {
    let config = resolve_config(cli.config)?;
    init_tracing(&config.log_level, &config.log_format);
    let engine = Arc::new(config.engine());

    match cli.command {
        Command::Encrypt {
            plaintext,
            key_type,
            algorithm,
        } => {
            let algorithm = algorithm.map(Algorithm::from).unwrap_or(engine.default_algorithm());
            match engine.encrypt_with(&plaintext, key_type, algorithm) {
                Ok(ciphertext) => println!("{ciphertext}"),
                Err(err) => {
                    error!(error = %err, "encryption failed");
                    return Err(err.user_message().into());
                }
            }
        }
        Command::Decrypt {
            ciphertext,
            key_type,
            strict,
        } => {
            if strict || config.engine.strict_reads {
                println!("{}", engine.decrypt_strict(&ciphertext, key_type)?);
            } else {
                println!("{}", engine.decrypt(&ciphertext, key_type));
            }
        }
        Command::Upgrade { value, key_type } => {
            println!("{}", engine.upgrade(&value, key_type)?);
        }
        Command::AuditCreate {
            action,
            resource,
            details,
        } => {
            let details: Value = match details {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Null,
            };
            let codec = audit_codec(engine);
            let sealed = match &config.audit_log_path {
                Some(path) => AuditTrail::new(path, codec).append(&action, &resource, details)?,
                None => codec.create_entry(&action, &resource, details),
            };
            println!("{sealed}");
        }
        Command::AuditVerify { entry } => {
            let codec = audit_codec(engine);
            let verified: Vec<_> = match (entry, &config.audit_log_path) {
                (Some(sealed), _) => codec.verify_entry(&sealed).into_iter().collect(),
                (None, Some(path)) => AuditTrail::new(path, codec).read_all()?,
                (None, None) => return Err("no entry given and no audit_log_path configured".into()),
            };
            if verified.is_empty() {
                return Err("no readable audit entries".into());
            }
            let reports: Vec<Value> = verified
                .iter()
                .map(|v| {
                    json!({
                        "action": v.entry.action,
                        "resource": v.entry.resource,
                        "timestamp": v.entry.timestamp,
                        "details": v.entry.details,
                        "extra": v.entry.extra,
                        "checksumValid": v.checksum_valid,
                        "wasEncrypted": v.was_encrypted,
                    })
                })
                .collect();
            print_json(&Value::Array(reports))?;
        }
        Command::LockoutStatus { identity } => {
            let tracker = open_tracker(&config)?;
            let status = tracker.is_user_blocked(&identity)?;
            print_json(&json!({
                "isBlocked": status.is_blocked,
                "lockedUntil": status.locked_until,
                "lockExpired": status.lock_expired,
                "message": status.countdown(),
            }))?;
            tracker.close()?;
        }
        Command::LockoutRecord { identity } => {
            let tracker = open_tracker(&config)?;
            let status = tracker.record_failed_attempt(&identity)?;
            print_json(&json!({
                "attemptCount": status.attempt_count,
                "attemptsRemaining": status.attempts_remaining,
                "isBlocked": status.is_blocked,
                "lockedUntil": status.locked_until,
                "warning": status.warning,
            }))?;
            tracker.close()?;
        }
        Command::LockoutClear { identity } => {
            let tracker = open_tracker(&config)?;
            let cleared = tracker.clear_failed_attempts(&identity)?;
            print_json(&json!({ "cleared": cleared }))?;
            tracker.close()?;
        }
        Command::LockoutList => {
            let tracker = open_tracker(&config)?;
            let records = tracker.tracked_records()?;
            print_json(&serde_json::to_value(&records)?)?;
            tracker.close()?;
        }
        Command::EmergencyUnblock { identity, operator } => {
            let tracker = open_tracker(&config)?;
            let console = admin_console(&config, tracker.clone(), engine);
            let removed = console.emergency_unblock(&admin_token()?, &operator, &identity)?;
            print_json(&json!({ "removed": removed }))?;
            tracker.close()?;
        }
        Command::EmergencyClearAll { operator } => {
            let tracker = open_tracker(&config)?;
            let console = admin_console(&config, tracker.clone(), engine);
            let removed = console.emergency_clear_all(&admin_token()?, &operator)?;
            print_json(&json!({ "removed": removed }))?;
            tracker.close()?;
        }
        Command::HashBytes { data } => {
            println!("{}", sha256_hex(data.as_bytes()));
        }
    }
    Ok(())
}

fn admin_console(config: &GuardConfig, tracker: Arc<AttemptTracker>, engine: Arc<EncryptionEngine>) -> AdminConsole {
    let codec = audit_codec(engine);
    let token = config.admin_token_sha256.clone();
    match &config.audit_log_path {
        Some(path) => AdminConsole::with_trail(tracker, AuditTrail::new(path, codec), token),
        None => AdminConsole::new(tracker, codec, token),
    }
}

fn admin_token() -> Result<AdminToken, Box<dyn std::error::Error>> {
    std::env::var(ADMIN_TOKEN_ENV)
        .map(AdminToken::new)
        .map_err(|_| format!("{ADMIN_TOKEN_ENV} is not set").into())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("phi-guard: {err}");
            ExitCode::FAILURE
        }
    }
}
