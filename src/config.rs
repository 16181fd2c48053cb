use anyhow::{Error, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long)]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Shard count for the call and register aggregators.
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// Chrono format string for collection date suffixes.
    #[serde(default = "default_time_suffix")]
    pub time_suffix: String,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub udf: UdfConfig,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub ingest: Option<IngestConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SipConfig {
    #[serde(default)]
    pub message: SipMessageConfig,
    #[serde(default)]
    pub transaction: SipTransactionConfig,
    #[serde(default)]
    pub call: SipCallConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct SipMessageConfig {
    /// CSeq methods whose raw write and forwarding are suppressed. Metrics
    /// still count them.
    #[serde(default)]
    pub exclusions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SipTransactionConfig {
    #[serde(default = "default_transaction_expiration_delay_ms")]
    pub expiration_delay_ms: u64,
    #[serde(default = "default_transaction_termination_timeout_ms")]
    pub termination_timeout_ms: u64,
}

impl Default for SipTransactionConfig {
    fn default() -> Self {
        Self {
            expiration_delay_ms: default_transaction_expiration_delay_ms(),
            termination_timeout_ms: default_transaction_termination_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SipCallConfig {
    #[serde(default = "default_call_expiration_delay_ms")]
    pub expiration_delay_ms: u64,
    #[serde(default = "default_call_aggregation_timeout_ms")]
    pub aggregation_timeout_ms: u64,
}

impl Default for SipCallConfig {
    fn default() -> Self {
        Self {
            expiration_delay_ms: default_call_expiration_delay_ms(),
            aggregation_timeout_ms: default_call_aggregation_timeout_ms(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub rtpr: RtprConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RtprConfig {
    /// When set, media metrics are emitted once per terminated session
    /// instead of once per report.
    #[serde(default)]
    pub cumulative_metrics: bool,
    #[serde(default = "default_rtpr_expiration_delay_ms")]
    pub expiration_delay_ms: u64,
    #[serde(default = "default_rtpr_aggregation_timeout_ms")]
    pub aggregation_timeout_ms: u64,
}

impl Default for RtprConfig {
    fn default() -> Self {
        Self {
            cumulative_metrics: false,
            expiration_delay_ms: default_rtpr_expiration_delay_ms(),
            aggregation_timeout_ms: default_rtpr_aggregation_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdfConfig {
    #[serde(default = "default_udf_check_period_ms")]
    pub check_period_ms: u64,
    #[serde(default = "default_udf_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
}

impl Default for UdfConfig {
    fn default() -> Self {
        Self {
            check_period_ms: default_udf_check_period_ms(),
            execution_timeout_ms: default_udf_execution_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagementConfig {
    #[serde(default = "default_management_addr")]
    pub addr: String,
    #[serde(default = "default_management_expiration_delay_ms")]
    pub expiration_delay_ms: u64,
    #[serde(default = "default_management_expiration_timeout_ms")]
    pub expiration_timeout_ms: u64,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            addr: default_management_addr(),
            expiration_delay_ms: default_management_expiration_delay_ms(),
            expiration_timeout_ms: default_management_expiration_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum StorageConfig {
    Local {
        root: String,
        #[serde(default = "default_flush_count")]
        flush_count: usize,
        #[serde(default = "default_flush_interval_ms")]
        flush_interval_ms: u64,
    },
    Http {
        url: String,
        #[serde(default = "default_flush_count")]
        flush_count: usize,
        #[serde(default = "default_flush_interval_ms")]
        flush_interval_ms: u64,
    },
}

impl StorageConfig {
    pub fn flush_count(&self) -> usize {
        match self {
            StorageConfig::Local { flush_count, .. } => *flush_count,
            StorageConfig::Http { flush_count, .. } => *flush_count,
        }
    }

    pub fn flush_interval_ms(&self) -> u64 {
        match self {
            StorageConfig::Local {
                flush_interval_ms, ..
            } => *flush_interval_ms,
            StorageConfig::Http {
                flush_interval_ms, ..
            } => *flush_interval_ms,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            #[cfg(target_os = "windows")]
            root: "./voipmon-data".to_string(),
            #[cfg(not(target_os = "windows"))]
            root: "/tmp/voipmon-data".to_string(),
            flush_count: default_flush_count(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_healthz_path")]
    pub healthz_path: String,
    pub token: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
            healthz_path: default_healthz_path(),
            token: None,
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_instances() -> usize {
    1
}

fn default_time_suffix() -> String {
    "%Y%m%d".to_string()
}

fn default_transaction_expiration_delay_ms() -> u64 {
    100
}

fn default_transaction_termination_timeout_ms() -> u64 {
    32_000
}

fn default_call_expiration_delay_ms() -> u64 {
    1_000
}

fn default_call_aggregation_timeout_ms() -> u64 {
    120_000
}

fn default_rtpr_expiration_delay_ms() -> u64 {
    4_000
}

fn default_rtpr_aggregation_timeout_ms() -> u64 {
    30_000
}

fn default_udf_check_period_ms() -> u64 {
    300_000
}

fn default_udf_execution_timeout_ms() -> u64 {
    100
}

fn default_management_addr() -> String {
    "127.0.0.1:15060".to_string()
}

fn default_management_expiration_delay_ms() -> u64 {
    60_000
}

fn default_management_expiration_timeout_ms() -> u64 {
    120_000
}

fn default_flush_count() -> usize {
    1_000
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_healthz_path() -> String {
    "/healthz".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            log_level: None,
            log_file: None,
            instances: default_instances(),
            time_suffix: default_time_suffix(),
            sip: SipConfig::default(),
            media: MediaConfig::default(),
            udf: UdfConfig::default(),
            management: ManagementConfig::default(),
            storage: StorageConfig::default(),
            ingest: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation: a bad value here is fatal, named after the key.
    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(anyhow::anyhow!("instances must be at least 1"));
        }
        if self.time_suffix.is_empty() {
            return Err(anyhow::anyhow!("time_suffix must not be empty"));
        }
        if self.udf.execution_timeout_ms == 0 {
            return Err(anyhow::anyhow!("udf.execution_timeout_ms must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dump() {
        let config = Config::default();
        let config_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&config_str).unwrap();
        assert_eq!(parsed.instances, 1);
        assert_eq!(parsed.time_suffix, "%Y%m%d");
        parsed.validate().unwrap();
    }

    #[test]
    fn test_config_snippet() {
        let config: Config = toml::from_str(
            r#"
            http_addr = "0.0.0.0:9090"
            instances = 4

            [sip.message]
            exclusions = ["OPTIONS"]

            [media.rtpr]
            cumulative_metrics = true

            [storage]
            type = "http"
            url = "http://writer.internal/bulk"

            [ingest]
            addr = "0.0.0.0:3300"
            "#,
        )
        .unwrap();
        assert_eq!(config.instances, 4);
        assert_eq!(config.sip.message.exclusions, vec!["OPTIONS"]);
        assert!(config.media.rtpr.cumulative_metrics);
        assert!(matches!(config.storage, StorageConfig::Http { .. }));
        assert_eq!(config.ingest.unwrap().addr, "0.0.0.0:3300");
        assert_eq!(config.sip.transaction.termination_timeout_ms, 32_000);
    }

    #[test]
    fn test_validate_rejects_zero_instances() {
        let config = Config {
            instances: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("instances"));
    }
}
