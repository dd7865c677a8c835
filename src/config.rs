use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File};
use serde::Deserialize;

use crate::backend::RpcConfig;
use crate::funding::FundingConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::transaction::PairParams;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rpc: RpcConfig,
    pub registry: RegistryConfig,
    pub protocol: ProtocolConfig,
    pub watchers: WatcherConfig,
    pub funding: FundingConfig,
    #[serde(default)]
    pub certificates: CertificatesConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertificatesConfig {
    /// Directory of certificates to register before the run.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    pub fund_amount_sat: u64,
    pub revoke_fee_sat: u64,
    pub dust_threshold_sat: u64,
    pub fee_rate_sat_vb: u64,
    pub reason_code: u8,
    pub owner_label_suffix: String,
}

impl ProtocolConfig {
    pub fn pair_params(&self) -> PairParams {
        PairParams {
            fund_amount_sat: self.fund_amount_sat,
            revoke_fee_sat: self.revoke_fee_sat,
            dust_threshold_sat: self.dust_threshold_sat,
            fee_rate_sat_vb: self.fee_rate_sat_vb,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub mempool_interval_ms: u64,
    pub chain_interval_ms: u64,
    pub convergence_check_ms: u64,
    #[serde(default)]
    pub start_height: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("rpc.url", "http://127.0.0.1:18443")?
            .set_default("rpc.user", "blockvoke")?
            .set_default("rpc.password", "")?
            .set_default("rpc.timeout_secs", 30)?
            .set_default("registry.path", "working_dir/registry.csv")?
            .set_default("protocol.fund_amount_sat", 477)?
            .set_default("protocol.revoke_fee_sat", 170)?
            .set_default("protocol.dust_threshold_sat", 294)?
            .set_default("protocol.fee_rate_sat_vb", 1)?
            .set_default("protocol.reason_code", 0)?
            .set_default("protocol.owner_label_suffix", "-coaddress")?
            .set_default("watchers.mempool_interval_ms", 1000)?
            .set_default("watchers.chain_interval_ms", 5000)?
            .set_default("watchers.convergence_check_ms", 500)?
            .set_default("funding.enabled", false)?
            .set_default("funding.faucet_label", "faucet")?
            .set_default("funding.amount_sat", 600)?
            .set_default("funding.batch_size", 100)?
            .add_source(File::with_name("config/settings").required(false));

        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format APP_RPC__URL or APP_PROTOCOL__REASON_CODE
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.protocol
            .pair_params()
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        if self.funding.batch_size == 0 {
            return Err(ConfigError::Message(
                "funding.batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            reason_code: self.protocol.reason_code,
            owner_label_suffix: self.protocol.owner_label_suffix.clone(),
            mempool_interval: Duration::from_millis(self.watchers.mempool_interval_ms),
            chain_interval: Duration::from_millis(self.watchers.chain_interval_ms),
            convergence_check: Duration::from_millis(self.watchers.convergence_check_ms),
            start_height: self.watchers.start_height,
        }
    }
}
