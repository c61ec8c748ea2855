use std::time::Duration;

use anyhow::{bail, Context};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use strum_macros::{AsRefStr, Display};

use crate::transfer::adapters::near_rpc::{parse_secret_key, public_key_string};
use crate::transfer::{ActionBudget, BenchmarkInfo, EngineConfig, SlotKey};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

const SIMULATED_ACCOUNT: &str = "sender.simulated.testnet";
const SIMULATED_CONTRACT: &str = "ft.simulated.testnet";

/// Which chain collaborator the server talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainMode {
    /// NEAR JSON-RPC
    Near,
    /// In-process mock with fixed latency
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub network: String,
    pub rpc_url: String,
    pub sender_account_id: String,
    pub sender_private_key: String,
    /// Comma-separated additional full-access keys of the sender account
    pub extra_private_keys: String,
    pub ft_contract_id: String,

    pub port: u16,
    pub api_host: String,

    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub access_key_count: usize,
    pub batch_interval_ms: u64,
    pub throughput_window_ms: i64,
    pub submit_timeout_ms: u64,
    pub slot_acquire_timeout_ms: u64,
    pub gas_per_action: u64,
    /// yoctoNEAR, decimal string
    pub deposit_per_action: String,

    pub store_path: String,
    pub status_retention_days: u64,

    pub chain_mode: ChainMode,
    pub simulated_latency_ms: u64,

    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,

    pub benchmark_target_transfers: u64,
    pub benchmark_duration_seconds: u64,
    pub benchmark_concurrency: u32,
    pub event_log_capacity: usize,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Defaults, then the optional file at `path`, then environment variables
/// (`MAX_BATCH_SIZE=50` overrides `max_batch_size`)
pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    dotenv::dotenv().ok();

    let s = Config::builder()
        // Set defaults
        .set_default("network", "testnet")?
        .set_default("rpc_url", "https://rpc.testnet.near.org")?
        .set_default("sender_account_id", "")?
        .set_default("sender_private_key", "")?
        .set_default("extra_private_keys", "")?
        .set_default("ft_contract_id", "")?
        .set_default("port", 3000)?
        .set_default("api_host", "0.0.0.0")?
        .set_default("max_batch_size", 100)?
        .set_default("max_concurrent_batches", 10)?
        .set_default("access_key_count", 10)?
        .set_default("batch_interval_ms", 100)?
        .set_default("throughput_window_ms", 60_000)?
        .set_default("submit_timeout_ms", 30_000)?
        .set_default("slot_acquire_timeout_ms", 5_000)?
        .set_default("gas_per_action", 30_000_000_000_000u64)?
        .set_default("deposit_per_action", "1")?
        .set_default("store_path", "data/ft_batcher")?
        .set_default("status_retention_days", 7)?
        .set_default("chain_mode", "near")?
        .set_default("simulated_latency_ms", 50)?
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/ft_batcher.log")?
        .set_default("benchmark_target_transfers", 60_000)?
        .set_default("benchmark_duration_seconds", 600)?
        .set_default("benchmark_concurrency", 10)?
        .set_default("event_log_capacity", 500)?
        // Add configuration from a file
        .add_source(File::with_name(path).required(false))
        // Add configuration from environment variables
        .add_source(Environment::default().try_parsing(true))
        .build()?;

    s.try_deserialize()
}

impl AppConfig {
    /// Check everything the chosen chain mode needs; reports every problem at
    /// once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors: Vec<&str> = Vec::new();

        if self.chain_mode == ChainMode::Near {
            if self.sender_account_id.is_empty() {
                errors.push("SENDER_ACCOUNT_ID is required");
            }
            if self.sender_private_key.is_empty() {
                errors.push("SENDER_PRIVATE_KEY is required");
            }
            if self.ft_contract_id.is_empty() {
                errors.push("FT_CONTRACT_ID is required");
            }
            if self.rpc_url.is_empty() {
                errors.push("RPC_URL is required");
            }
        }
        if self.max_batch_size == 0 {
            errors.push("MAX_BATCH_SIZE must be greater than 0");
        }
        if self.max_concurrent_batches == 0 {
            errors.push("MAX_CONCURRENT_BATCHES must be greater than 0");
        }
        if self.access_key_count == 0 {
            errors.push("ACCESS_KEY_COUNT must be greater than 0");
        }
        if self.batch_interval_ms == 0 {
            errors.push("BATCH_INTERVAL_MS must be greater than 0");
        }
        if self.deposit_per_action.parse::<u128>().is_err() {
            errors.push("DEPOSIT_PER_ACTION must be an unsigned integer");
        }

        if !errors.is_empty() {
            bail!("Configuration validation failed: {}", errors.join("; "));
        }
        Ok(())
    }

    /// Signing keys: the sender key plus any extra keys, each as
    /// `(ed25519:<public>, ed25519:<secret>)`
    pub fn signing_keys(&self) -> anyhow::Result<Vec<SlotKey>> {
        if self.chain_mode == ChainMode::Simulated && self.sender_private_key.is_empty() {
            return Ok(vec![SlotKey::new("ed25519:simulated", "")]);
        }

        std::iter::once(self.sender_private_key.as_str())
            .chain(self.extra_private_keys.split(','))
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .enumerate()
            .map(|(i, secret)| {
                let key = parse_secret_key(secret).with_context(|| format!("signing key #{} is invalid", i))?;
                Ok(SlotKey::new(public_key_string(&key), secret))
            })
            .collect()
    }

    pub fn account_id(&self) -> &str {
        match (self.chain_mode, self.sender_account_id.is_empty()) {
            (ChainMode::Simulated, true) => SIMULATED_ACCOUNT,
            _ => &self.sender_account_id,
        }
    }

    pub fn contract_id(&self) -> &str {
        match (self.chain_mode, self.ft_contract_id.is_empty()) {
            (ChainMode::Simulated, true) => SIMULATED_CONTRACT,
            _ => &self.ft_contract_id,
        }
    }

    /// Settings the batching engine consumes
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let deposit = self
            .deposit_per_action
            .parse::<u128>()
            .context("DEPOSIT_PER_ACTION must be an unsigned integer")?;

        Ok(EngineConfig {
            account_id: self.account_id().to_string(),
            contract_id: self.contract_id().to_string(),
            keys: self.signing_keys()?,
            slot_count: self.access_key_count,
            max_batch_size: self.max_batch_size,
            max_concurrent_batches: self.max_concurrent_batches,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            throughput_window_ms: self.throughput_window_ms,
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
            slot_acquire_timeout: Duration::from_millis(self.slot_acquire_timeout_ms),
            budget: ActionBudget {
                gas: self.gas_per_action,
                deposit,
            },
            benchmark: BenchmarkInfo {
                target_transfers: self.benchmark_target_transfers,
                concurrent_requests: self.benchmark_concurrency,
                duration_seconds: self.benchmark_duration_seconds,
            },
            ..EngineConfig::default()
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.port)
    }

    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status_retention_days * 24 * 60 * 60)
    }
}
