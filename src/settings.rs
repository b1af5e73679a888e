//! Configuration loading
//!
//! Resolves node settings from an optional `escrow.toml` file merged with
//! `ESCROW_`-prefixed environment variables, then lowers them into the
//! per-component config structs.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    error::EscrowError,
    ledger::LedgerConfig,
    node::EscrowNodeConfig,
    notifier::NotifierConfig,
    orchestrator::OrchestratorConfig,
    policy::ReleasePolicyConfig,
    sweep::SweeperConfig,
    EscrowResult,
};

/// Ledger settings section
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            contract_address: String::new(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Node settings as read from file and environment
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ledger: LedgerSettings,
    /// Grace period, in days, before funds auto-release without feedback
    #[serde(default = "default_release_timeout_days")]
    pub release_timeout_days: i64,
    /// Seconds between auto-release sweep cycles
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum booking amount accepted at creation
    #[serde(default = "default_max_booking_amount")]
    pub max_booking_amount: Decimal,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ledger: LedgerSettings::default(),
            release_timeout_days: default_release_timeout_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_booking_amount: default_max_booking_amount(),
        }
    }
}

fn default_rpc_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_confirm_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_release_timeout_days() -> i64 {
    7
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_booking_amount() -> Decimal {
    Decimal::from(1_000_000)
}

impl Settings {
    /// Load settings from `escrow.toml` (optional) and `ESCROW_*` env vars
    pub fn load() -> EscrowResult<Self> {
        let resolved = config::Config::builder()
            .add_source(config::File::with_name("escrow").required(false))
            .add_source(
                config::Environment::with_prefix("ESCROW")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| EscrowError::config(e.to_string()))?;

        resolved
            .try_deserialize()
            .map_err(|e| EscrowError::config(e.to_string()))
    }

    /// Lower settings into the node's component configs
    pub fn into_node_config(self) -> EscrowNodeConfig {
        EscrowNodeConfig {
            orchestrator: OrchestratorConfig {
                max_booking_amount: self.max_booking_amount,
                ..OrchestratorConfig::default()
            },
            ledger: LedgerConfig {
                rpc_url: self.ledger.rpc_url,
                contract_address: self.ledger.contract_address,
                confirm_timeout_secs: self.ledger.confirm_timeout_secs,
                poll_interval_ms: self.ledger.poll_interval_ms,
                max_attempts: self.ledger.max_attempts,
            },
            policy: ReleasePolicyConfig {
                release_timeout: Duration::days(self.release_timeout_days),
            },
            notifier: NotifierConfig::default(),
            sweep: SweeperConfig {
                interval_secs: self.sweep_interval_secs,
            },
        }
    }
}
