use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// ledger network selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
    Localnet,
}

impl Network {
    /// default blob-service endpoint for the network
    pub fn blob_endpoint(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://blobs.mainnet.walgit.io",
            Network::Testnet => "https://blobs.testnet.walgit.io",
            Network::Devnet => "https://blobs.devnet.walgit.io",
            Network::Localnet => "http://127.0.0.1:9123",
        }
    }

    /// default ledger endpoint for the network
    pub fn ledger_endpoint(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://fullnode.mainnet.walgit.io",
            Network::Testnet => "https://fullnode.testnet.walgit.io",
            Network::Devnet => "https://fullnode.devnet.walgit.io",
            Network::Localnet => "http://127.0.0.1:9000",
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Devnet
    }
}

/// repository identity and defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// ledger object id once the repository exists on-chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// threshold encryption policy for per-commit deks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// network and ledger wiring
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub network: Network,
    /// deployed ledger module; overridden by WALGIT_PACKAGE_ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_endpoint: Option<String>,
    /// master toggle for remote/ledger use; overridden by WALGIT_USE_BLOCKCHAIN
    #[serde(default = "default_true")]
    pub use_remote: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            package_id: None,
            blob_endpoint: None,
            ledger_endpoint: None,
            use_remote: true,
        }
    }
}

/// transport and cache sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// payloads above this upload in chunks
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// concurrent chunk transfers per payload
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
    #[serde(default = "default_memory_cache")]
    pub memory_cache_bytes: u64,
    #[serde(default = "default_fs_cache")]
    pub fs_cache_bytes: u64,
    #[serde(default = "default_persistent_cache")]
    pub persistent_cache_bytes: u64,
}

fn default_chunk_size() -> u64 {
    1024 * 1024
}
fn default_chunk_concurrency() -> usize {
    5
}
fn default_write_attempts() -> u32 {
    3
}
fn default_read_attempts() -> u32 {
    4
}
fn default_memory_cache() -> u64 {
    100 * 1024 * 1024
}
fn default_fs_cache() -> u64 {
    500 * 1024 * 1024
}
fn default_persistent_cache() -> u64 {
    1024 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_concurrency: default_chunk_concurrency(),
            write_attempts: default_write_attempts(),
            read_attempts: default_read_attempts(),
            memory_cache_bytes: default_memory_cache(),
            fs_cache_bytes: default_fs_cache(),
            persistent_cache_bytes: default_persistent_cache(),
        }
    }
}

/// transaction engine sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// commits per push batch
    #[serde(default = "default_push_batch")]
    pub push_batch_commits: usize,
    /// fraction of the ledger block-size cap a single transaction may use
    #[serde(default = "default_tx_size_fraction")]
    pub tx_size_fraction: f64,
    /// ledger block-size cap in bytes
    #[serde(default = "default_block_size_cap")]
    pub block_size_cap: u64,
    #[serde(default = "default_gas_safety")]
    pub gas_safety_factor: f64,
    #[serde(default = "default_merge_gas_safety")]
    pub merge_gas_safety_factor: f64,
    #[serde(default = "default_max_gas")]
    pub max_gas: u64,
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,
    /// confirmation timeout in seconds
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

fn default_push_batch() -> usize {
    5
}
fn default_tx_size_fraction() -> f64 {
    0.8
}
fn default_block_size_cap() -> u64 {
    128 * 1024
}
fn default_gas_safety() -> f64 {
    1.2
}
fn default_merge_gas_safety() -> f64 {
    1.5
}
fn default_max_gas() -> u64 {
    5_000_000_000
}
fn default_submit_attempts() -> u32 {
    3
}
fn default_wait_timeout() -> u64 {
    120
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            push_batch_commits: default_push_batch(),
            tx_size_fraction: default_tx_size_fraction(),
            block_size_cap: default_block_size_cap(),
            gas_safety_factor: default_gas_safety(),
            merge_gas_safety_factor: default_merge_gas_safety(),
            max_gas: default_max_gas(),
            submit_attempts: default_submit_attempts(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

/// a configured remote repository
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    /// ledger repository object id
    pub repo_id: String,
}

impl Remote {
    pub fn new(name: impl Into<String>, repo_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo_id: repo_id.into(),
        }
    }
}

/// repository configuration stored in .walgit/config.toml
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remotes: Vec<Remote>,
}

impl Config {
    /// create a new config for a repository name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            repository: RepositoryConfig {
                name: name.into(),
                default_branch: default_branch(),
                id: None,
                owner: None,
                policy_id: None,
            },
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            ledger: LedgerConfig::default(),
            remotes: vec![],
        }
    }

    /// load config from file and apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// environment wins over the file for deployment toggles
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("WALGIT_USE_BLOCKCHAIN") {
            self.network.use_remote = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("WALGIT_PACKAGE_ID") {
            if !v.is_empty() {
                self.network.package_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var("WALGIT_BLOB_ENDPOINT") {
            if !v.is_empty() {
                self.network.blob_endpoint = Some(v);
            }
        }
        if let Ok(v) = std::env::var("WALGIT_LEDGER_ENDPOINT") {
            if !v.is_empty() {
                self.network.ledger_endpoint = Some(v);
            }
        }
    }

    /// resolved blob-service endpoint
    pub fn blob_endpoint(&self) -> String {
        self.network
            .blob_endpoint
            .clone()
            .unwrap_or_else(|| self.network.network.blob_endpoint().to_string())
    }

    /// resolved ledger endpoint
    pub fn ledger_endpoint(&self) -> String {
        self.network
            .ledger_endpoint
            .clone()
            .unwrap_or_else(|| self.network.network.ledger_endpoint().to_string())
    }

    /// add a remote
    pub fn add_remote(&mut self, name: impl Into<String>, repo_id: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.remotes.iter().any(|r| r.name == name) {
            return Err(Error::Format(format!("remote '{}' already exists", name)));
        }
        self.remotes.push(Remote {
            name,
            repo_id: repo_id.into(),
        });
        Ok(())
    }

    /// remove a remote
    pub fn remove_remote(&mut self, name: &str) -> Result<()> {
        let pos = self
            .remotes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::NotFound {
                kind: "remote",
                id: name.to_string(),
            })?;
        self.remotes.remove(pos);
        Ok(())
    }

    /// get remote by name
    pub fn get_remote(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = Config::new("demo");
        config.repository.id = Some("0xrepo".into());
        config.network.network = Network::Testnet;
        config.remotes.push(Remote::new("origin", "0xabc"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.repository.name, "demo");
        assert_eq!(parsed.repository.id.as_deref(), Some("0xrepo"));
        assert_eq!(parsed.network.network, Network::Testnet);
        assert_eq!(parsed.remotes, config.remotes);
    }

    #[test]
    fn test_config_minimal_toml() {
        let toml_str = r#"
[repository]
name = "tiny"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.repository.default_branch, "main");
        assert_eq!(config.storage.chunk_size, 1024 * 1024);
        assert_eq!(config.storage.chunk_concurrency, 5);
        assert_eq!(config.ledger.push_batch_commits, 5);
        assert!(config.network.use_remote);
        assert!(config.remotes.is_empty());
    }

    #[test]
    fn test_config_add_remove_remote() {
        let mut config = Config::new("demo");

        config.add_remote("origin", "0xabc").unwrap();
        assert_eq!(config.remotes.len(), 1);

        // duplicate should fail
        assert!(config.add_remote("origin", "0xother").is_err());

        let r = config.get_remote("origin").unwrap();
        assert_eq!(r.repo_id, "0xabc");

        config.remove_remote("origin").unwrap();
        assert!(config.remotes.is_empty());
        assert!(config.remove_remote("origin").is_err());
    }

    #[test]
    fn test_network_endpoints() {
        let config = Config::new("demo");
        assert!(config.blob_endpoint().contains("devnet"));

        let mut config = Config::new("demo");
        config.network.blob_endpoint = Some("http://localhost:1234".into());
        assert_eq!(config.blob_endpoint(), "http://localhost:1234");
    }
}
