//! Environment-driven configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Staging directory for uploaded input files
    pub upload_dir: PathBuf,
    /// Root directory for per-stream HLS output
    pub output_dir: PathBuf,
    /// Request body cap in bytes
    pub max_file_size: usize,
    /// Maximum number of concurrently running stream sessions
    pub max_concurrent_streams: usize,
    /// Wait after SIGTERM before escalating to SIGKILL
    pub stop_grace: Duration,
    /// How long a pending two-phase merge stays redeemable
    pub merge_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables, with defaults matching
    /// a local single-server deployment.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("0.0.0.0")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("9001")),
            upload_dir: PathBuf::from(
                env::var("UPLOAD_DIR").unwrap_or_else(|_| String::from("uploads")),
            ),
            output_dir: PathBuf::from(
                env::var("OUTPUT_DIR").unwrap_or_else(|_| String::from("output")),
            ),
            max_file_size: env::var("MAX_FILE_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(500)
                * 1024
                * 1024,
            max_concurrent_streams: env::var("MAX_CONCURRENT_STREAMS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            stop_grace: Duration::from_secs(
                env::var("STOP_GRACE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            merge_ttl: Duration::from_secs(
                env::var("MERGE_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::from_env();
        assert_eq!(config.max_concurrent_streams, 10);
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.max_file_size, 500 * 1024 * 1024);
    }
}
