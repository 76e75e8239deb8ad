use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ledger::Amount;

pub const DEFAULT_STATE_DIR: &str = "atm.state";
pub const DEFAULT_FAUCET_GRANT: Amount = 1_000;
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a failed ownership transfer stays visible on the session.
pub const OWNER_ERROR_TTL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub state_dir: PathBuf,
    pub confirm_timeout: Duration,
    pub faucet_grant: Amount,
}

impl NodeConfig {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            faucet_grant: DEFAULT_FAUCET_GRANT,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn chain_path(&self) -> PathBuf {
        self.state_dir.join("chain.json")
    }

    pub fn node_key_path(&self) -> PathBuf {
        self.state_dir.join("node.sk.hex")
    }

    pub fn node_pubkey_path(&self) -> PathBuf {
        self.state_dir.join("node.pk.hex")
    }

    pub fn keystore_dir(&self) -> PathBuf {
        self.state_dir.join("keystore")
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        if !self.state_dir.exists() {
            fs::create_dir_all(&self.state_dir)?;
        }
        let keystore = self.keystore_dir();
        if !keystore.exists() {
            fs::create_dir_all(&keystore)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_the_state_dir() {
        let config = NodeConfig::new(PathBuf::from("some.state"));
        assert!(config.chain_path().starts_with("some.state"));
        assert!(config.node_key_path().starts_with("some.state"));
        assert!(config.keystore_dir().starts_with("some.state"));
    }
}
