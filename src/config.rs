use anyhow::{Context, bail};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;

/// Consecutive failures that pause a sync record. Not tunable.
pub const SYNC_FAIL_THRESHOLD: i32 = 10;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub gateway: GatewayConfig,
    /// PostgreSQL connection URL. Absent = in-memory development mode.
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub postgres_pool_size: u32,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

fn default_pool_size() -> u32 {
    20
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub web_ui_url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub partner_id: i64,
    pub partner_key: String,
    pub timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://partner.marketplace.example".to_string(),
            partner_id: 0,
            partner_key: String::new(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub orders_interval_secs: u64,
    pub income_interval_secs: u64,
    pub escrow_interval_secs: u64,
    /// Attempts per upstream call before a transient error is surfaced
    pub max_retries: u32,
    pub fail_threshold: i32,
    pub orders_page_size: u32,
    pub income_page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            orders_interval_secs: 300,
            income_interval_secs: 600,
            escrow_interval_secs: 900,
            max_retries: 5,
            fail_threshold: SYNC_FAIL_THRESHOLD,
            orders_page_size: 50,
            income_page_size: 100,
        }
    }
}

impl SyncConfig {
    pub fn orders_page_size(&self) -> u32 {
        self.orders_page_size.clamp(20, 100)
    }

    pub fn income_page_size(&self) -> u32 {
        self.income_page_size.clamp(20, 100)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SettlementConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    pub platform_rate: Decimal,
    pub operator_rate: Decimal,
    pub shop_owner_rate: Decimal,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 200,
            platform_rate: Decimal::from(5),
            operator_rate: Decimal::from(45),
            shop_owner_rate: Decimal::from(50),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebhookConfig {
    pub queue_size: usize,
    pub dedupe_window_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            dedupe_window_secs: 86_400,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config file: {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sync.fail_threshold != SYNC_FAIL_THRESHOLD {
            bail!(
                "sync.fail_threshold must be {}, got {}",
                SYNC_FAIL_THRESHOLD,
                self.sync.fail_threshold
            );
        }
        let s = &self.settlement;
        if s.platform_rate + s.operator_rate + s.shop_owner_rate != Decimal::ONE_HUNDRED {
            bail!("settlement default rates must sum to 100");
        }
        if self.webhook.queue_size == 0 {
            bail!("webhook.queue_size must be positive");
        }
        Ok(())
    }
}
