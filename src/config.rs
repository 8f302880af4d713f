//! Server configuration
//!
//! CLI arguments with environment variable fallbacks using clap.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const MIN_KEY_BITS: u32 = 1024;

/// Vouch - RSA key-possession authentication and trust signatures
#[derive(Parser, Debug, Clone)]
#[command(name = "vouch")]
#[command(about = "Authenticates RSA key holders and records trust signatures")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Public host name of this server, published by /a/identity
    #[arg(long, env = "HOST_NAME")]
    pub host_name: String,

    /// Server private key (PKCS#8 PEM). Generated on first start if missing.
    #[arg(long, env = "KEY_FILE")]
    pub key_file: PathBuf,

    /// Modulus size used when generating the server key
    #[arg(long, env = "KEY_BITS", default_value = "2048")]
    pub key_bits: u32,

    /// Google Cloud project hosting the Firestore database.
    /// The in-memory store is used when unset.
    #[arg(long, env = "FIRESTORE_PROJECT")]
    pub firestore_project: Option<String>,

    /// Service account key file for Firestore
    #[arg(long, env = "FIRESTORE_KEY_FILE")]
    pub firestore_key_file: Option<PathBuf>,

    /// Seconds a challenge stays answerable
    #[arg(long, env = "CHALLENGE_TTL_SECS", default_value = "5")]
    pub challenge_ttl_secs: u64,

    /// Seconds a session survives without a refresh
    #[arg(long, env = "SESSION_TTL_SECS", default_value = "3600")]
    pub session_ttl_secs: u64,

    /// Seconds between sweeps of expired challenges and sessions
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "5")]
    pub sweep_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host_name.trim().is_empty() {
            return Err("HOST_NAME must not be empty".to_string());
        }

        if self.key_bits < MIN_KEY_BITS {
            return Err(format!("KEY_BITS must be at least {MIN_KEY_BITS}"));
        }

        if self.challenge_ttl_secs == 0 || self.session_ttl_secs == 0 {
            return Err("TTL values must be greater than zero".to_string());
        }

        if self.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be greater than zero".to_string());
        }

        if self.firestore_project.is_some() && self.firestore_key_file.is_none() {
            return Err("FIRESTORE_KEY_FILE is required with FIRESTORE_PROJECT".to_string());
        }

        Ok(())
    }
}
