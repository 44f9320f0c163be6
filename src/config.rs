//! Command-line / environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::storage::DEFAULT_CHAIN_FILE;

/// Ledger node recording the outcome of email-voted requests.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory holding the chain snapshot.
    #[arg(long, env = "LEDGER_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Snapshot filename inside `data_dir`.
    #[arg(long, env = "LEDGER_CHAIN_FILE", default_value = DEFAULT_CHAIN_FILE)]
    pub chain_file: String,

    /// Address the HTTP front end listens on.
    #[arg(long, env = "LEDGER_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Upper bound on a single snapshot write, in milliseconds.
    #[arg(long, env = "LEDGER_SAVE_TIMEOUT_MS", default_value_t = 5_000)]
    pub save_timeout_ms: u64,
}

impl Config {
    pub fn chain_path(&self) -> PathBuf {
        self.data_dir.join(&self.chain_file)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_chain_file() {
        let config = Config::try_parse_from(["ledger"]).unwrap();
        assert_eq!(config.chain_path(), PathBuf::from("data").join("local_chain.json"));
        assert_eq!(config.listen, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.save_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "ledger",
            "--data-dir",
            "/var/lib/ledger",
            "--chain-file",
            "votes.json",
            "--listen",
            "0.0.0.0:8080",
            "--save-timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(config.chain_path(), PathBuf::from("/var/lib/ledger/votes.json"));
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.save_timeout(), Duration::from_millis(250));
    }
}
