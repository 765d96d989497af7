use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, time::Duration};

const GIB: i64 = 1024 * 1024 * 1024;
const MIB: i64 = 1024 * 1024;

/// Connection settings for an S3-compatible backend.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// `endpoint/bucket/key` instead of `bucket.endpoint/key`.
    pub path_style: bool,
    /// Value of `x-amz-server-side-encryption` sent on every write.
    pub server_side_encryption: Option<String>,
    /// Create the bucket on first use if it does not exist.
    pub create_bucket: bool,
}

/// The single storage backend used by the process.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { root: String },
    S3(S3Config),
}

/// Limits and timings for the vault engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quota given to owners on first touch.
    pub default_quota_bytes: i64,
    pub max_upload_bytes: i64,
    /// Upper bound for any single backend call.
    pub storage_timeout: Duration,
    /// How long a duplicate upload waits for the first writer to finish.
    pub content_wait_timeout: Duration,
    /// Lifetime of a write or delete claim. Must exceed `storage_timeout`.
    pub claim_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_quota_bytes: 10 * GIB,
            max_upload_bytes: 512 * MIB,
            storage_timeout: Duration::from_secs(30),
            content_wait_timeout: Duration::from_secs(60),
            claim_lease: Duration::from_secs(120),
        }
    }
}

/// Background reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Blobs with no content row are removed only once older than this.
    pub orphan_grace: Duration,
    /// Rewrite counters that drift from their source of truth.
    pub repair_drift: bool,
    pub batch_size: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(24 * 3600),
            repair_drift: false,
            batch_size: 100,
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub reconcile: ReconcileConfig,
}

/// What the binary should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    ReconcileOnce,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Content-addressed multi-tenant file vault")]
pub struct Args {
    /// Host to bind the health endpoints to (overrides VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `local` or `s3` (overrides VAULT_STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<String>,

    /// Directory for the local backend (overrides VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// S3 endpoint URL (overrides VAULT_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// S3 bucket (overrides VAULT_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Default per-owner quota in bytes (overrides VAULT_DEFAULT_QUOTA_BYTES)
    #[arg(long)]
    pub default_quota_bytes: Option<i64>,

    /// Reconcile interval in seconds (overrides VAULT_RECONCILE_INTERVAL_SECS)
    #[arg(long)]
    pub reconcile_interval_secs: Option<u64>,

    /// Repair counter drift during reconciliation (overrides VAULT_REPAIR_DRIFT)
    #[arg(long)]
    pub repair_drift: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run a single reconciliation sweep and exit
    #[arg(long, conflicts_with = "migrate")]
    pub reconcile_once: bool,
}

/// Environment lookup, injectable for tests.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_string(lookup: Lookup<'_>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{value}`")),
        None => Ok(default),
    }
}

fn env_secs(lookup: Lookup<'_>, key: &str, default: Duration) -> Result<Duration> {
    env_parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn env_required(lookup: Lookup<'_>, key: &str) -> Result<String> {
    lookup(key).with_context(|| format!("{key} must be set for the s3 backend"))
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        Self::resolve(args, &|key: &str| env::var(key).ok())
    }

    /// Merge CLI args over values from `lookup`.
    pub fn resolve(args: Args, lookup: Lookup<'_>) -> Result<(Self, RunMode)> {
        let backend = args
            .storage_backend
            .clone()
            .unwrap_or_else(|| env_string(lookup, "VAULT_STORAGE_BACKEND", "local"));
        let storage = match backend.to_ascii_lowercase().as_str() {
            "local" => StorageConfig::Local {
                root: args
                    .storage_dir
                    .clone()
                    .unwrap_or_else(|| env_string(lookup, "VAULT_STORAGE_DIR", "./data/blobs")),
            },
            "s3" => StorageConfig::S3(S3Config {
                endpoint: match args.s3_endpoint.clone() {
                    Some(endpoint) => endpoint,
                    None => env_required(lookup, "VAULT_S3_ENDPOINT")?,
                },
                region: env_string(lookup, "VAULT_S3_REGION", "us-east-1"),
                bucket: match args.s3_bucket.clone() {
                    Some(bucket) => bucket,
                    None => env_required(lookup, "VAULT_S3_BUCKET")?,
                },
                access_key_id: env_required(lookup, "VAULT_S3_ACCESS_KEY_ID")?,
                secret_access_key: env_required(lookup, "VAULT_S3_SECRET_ACCESS_KEY")?,
                path_style: env_parse(lookup, "VAULT_S3_PATH_STYLE", true)?,
                server_side_encryption: match lookup("VAULT_S3_SSE") {
                    Some(v) if v.is_empty() || v.eq_ignore_ascii_case("none") => None,
                    Some(v) => Some(v),
                    None => Some("AES256".to_string()),
                },
                create_bucket: env_parse(lookup, "VAULT_S3_CREATE_BUCKET", true)?,
            }),
            other => bail!("unknown storage backend `{other}`, expected `local` or `s3`"),
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            default_quota_bytes: match args.default_quota_bytes {
                Some(v) => v,
                None => env_parse(
                    lookup,
                    "VAULT_DEFAULT_QUOTA_BYTES",
                    defaults.default_quota_bytes,
                )?,
            },
            max_upload_bytes: env_parse(
                lookup,
                "VAULT_MAX_UPLOAD_BYTES",
                defaults.max_upload_bytes,
            )?,
            storage_timeout: env_secs(
                lookup,
                "VAULT_STORAGE_TIMEOUT_SECS",
                defaults.storage_timeout,
            )?,
            content_wait_timeout: env_secs(
                lookup,
                "VAULT_CONTENT_WAIT_SECS",
                defaults.content_wait_timeout,
            )?,
            claim_lease: env_secs(lookup, "VAULT_CLAIM_LEASE_SECS", defaults.claim_lease)?,
        };
        if engine.default_quota_bytes < 0 || engine.max_upload_bytes <= 0 {
            bail!("quota and upload limits must be positive");
        }
        if engine.claim_lease <= engine.storage_timeout {
            bail!(
                "claim lease ({:?}) must be longer than the storage timeout ({:?})",
                engine.claim_lease,
                engine.storage_timeout
            );
        }

        let defaults = ReconcileConfig::default();
        let reconcile = ReconcileConfig {
            interval: match args.reconcile_interval_secs {
                Some(secs) => Duration::from_secs(secs),
                None => env_secs(lookup, "VAULT_RECONCILE_INTERVAL_SECS", defaults.interval)?,
            },
            orphan_grace: env_secs(lookup, "VAULT_ORPHAN_GRACE_SECS", defaults.orphan_grace)?,
            repair_drift: args.repair_drift
                || env_parse(lookup, "VAULT_REPAIR_DRIFT", defaults.repair_drift)?,
            batch_size: defaults.batch_size,
        };

        let cfg = Self {
            host: args
                .host
                .clone()
                .unwrap_or_else(|| env_string(lookup, "VAULT_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env_parse(lookup, "VAULT_PORT", 3000)?,
            },
            database_url: args.database_url.clone().unwrap_or_else(|| {
                env_string(lookup, "VAULT_DATABASE_URL", "sqlite://./data/meta/vault.db")
            }),
            storage,
            engine,
            reconcile,
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.reconcile_once {
            RunMode::ReconcileOnce
        } else {
            RunMode::Serve
        };
        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve_with(args: Args, vars: &[(&str, &str)]) -> Result<(AppConfig, RunMode)> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::resolve(args, &|key: &str| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_use_local_backend() {
        let (cfg, mode) = resolve_with(Args::default(), &[]).unwrap();
        assert_eq!(mode, RunMode::Serve);
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert!(matches!(cfg.storage, StorageConfig::Local { ref root } if root == "./data/blobs"));
        assert!(cfg.engine.claim_lease > cfg.engine.storage_timeout);
        assert!(!cfg.reconcile.repair_drift);
    }

    #[test]
    fn test_s3_backend_from_env() {
        let (cfg, _) = resolve_with(
            Args::default(),
            &[
                ("VAULT_STORAGE_BACKEND", "s3"),
                ("VAULT_S3_ENDPOINT", "http://minio:9000"),
                ("VAULT_S3_BUCKET", "vault"),
                ("VAULT_S3_ACCESS_KEY_ID", "ak"),
                ("VAULT_S3_SECRET_ACCESS_KEY", "sk"),
                ("VAULT_S3_SSE", "none"),
                ("VAULT_S3_PATH_STYLE", "false"),
            ],
        )
        .unwrap();
        let StorageConfig::S3(s3) = cfg.storage else {
            panic!("expected s3 backend");
        };
        assert_eq!(s3.endpoint, "http://minio:9000");
        assert_eq!(s3.region, "us-east-1");
        assert!(!s3.path_style);
        assert!(s3.server_side_encryption.is_none());
        assert!(s3.create_bucket);
    }

    #[test]
    fn test_s3_requires_credentials() {
        let err = resolve_with(
            Args::default(),
            &[
                ("VAULT_STORAGE_BACKEND", "s3"),
                ("VAULT_S3_ENDPOINT", "http://minio:9000"),
                ("VAULT_S3_BUCKET", "vault"),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("VAULT_S3_ACCESS_KEY_ID"));
    }

    #[test]
    fn test_args_override_env() {
        let args = Args {
            port: Some(8080),
            storage_dir: Some("/srv/blobs".into()),
            reconcile_once: true,
            ..Args::default()
        };
        let (cfg, mode) = resolve_with(args, &[("VAULT_PORT", "9999")]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(mode, RunMode::ReconcileOnce);
        assert!(matches!(cfg.storage, StorageConfig::Local { ref root } if root == "/srv/blobs"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(resolve_with(Args::default(), &[("VAULT_PORT", "nope")]).is_err());
        assert!(resolve_with(Args::default(), &[("VAULT_STORAGE_BACKEND", "ftp")]).is_err());
        assert!(
            resolve_with(
                Args::default(),
                &[
                    ("VAULT_STORAGE_TIMEOUT_SECS", "60"),
                    ("VAULT_CLAIM_LEASE_SECS", "30")
                ]
            )
            .is_err()
        );
    }
}
