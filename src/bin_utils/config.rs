use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bitcoin::Network;
use clap::Args;
use reqwest::Client;
use rust_decimal::Decimal;

use crate::desk::DeskSettings;
use crate::models::UserId;
use crate::rates::{ExchangeRateApi, KrakenTicker, RateService};
use crate::upstream::{DEFAULT_TIMEOUT, build_client};
use crate::wallet::KeyDeriver;
use crate::watcher::{EsploraExplorer, WatcherSettings};
use crate::withdrawal::Commission;

/// Master key material. Every field can also come from the environment.
#[derive(Clone, Args)]
pub struct KeyConfig {
    /// BIP32 extended private key (xprv/tprv) deposit keys are derived from
    #[arg(long, env = "MASTER_KEY", hide_env_values = true)]
    pub master_key: String,

    /// bitcoin, testnet, signet or regtest
    #[arg(long, env = "NETWORK", default_value = "bitcoin")]
    pub network: Network,
}

impl KeyConfig {
    pub fn deriver(&self) -> Result<KeyDeriver> {
        KeyDeriver::from_master_key(&self.master_key, self.network)
            .context("Failed to load the master key")
    }
}

#[derive(Debug, Clone, Args)]
pub struct RateConfig {
    /// Kraken API base, queried for BTC/USD
    #[arg(long, env = "SPOT_URL", default_value = "https://api.kraken.com")]
    pub spot_url: String,

    /// open.er-api.com base, queried for USD to local currency
    #[arg(long, env = "FIAT_URL", default_value = "https://open.er-api.com")]
    pub fiat_url: String,

    #[arg(long, env = "FIAT_CURRENCY", default_value = "RUB")]
    pub fiat_currency: String,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub http_timeout_secs: u64,
}

impl RateConfig {
    pub fn http_client(&self) -> Result<Client> {
        build_client(Duration::from_secs(self.http_timeout_secs))
            .context("Failed to build the HTTP client")
    }

    pub fn rate_service(&self, client: &Client) -> RateService {
        RateService::new(
            Arc::new(KrakenTicker::new(client.clone(), &self.spot_url)),
            Arc::new(ExchangeRateApi::new(
                client.clone(),
                &self.fiat_url,
                &self.fiat_currency,
            )),
        )
    }
}

#[derive(Clone, Args)]
pub struct DeskConfig {
    #[command(flatten)]
    pub key: KeyConfig,

    #[command(flatten)]
    pub rates: RateConfig,

    /// Chat id of the administrator
    #[arg(long, env = "ADMIN_ID")]
    pub admin_id: UserId,

    /// Esplora API base
    #[arg(long, env = "EXPLORER_URL", default_value = "https://mempool.space/api")]
    pub explorer_url: String,

    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 600)]
    pub poll_interval_secs: u64,

    /// Pause between two users of one poll sweep
    #[arg(long, env = "POLL_DELAY_MS", default_value_t = 1000)]
    pub poll_delay_ms: u64,

    /// Operator margin shown on payouts, as a fraction
    #[arg(long, env = "COMMISSION", default_value = "0.06")]
    pub commission: Decimal,

    /// Local-currency price of 1 BTC to credit at when the rate sources are down.
    /// Unset means such polls are retried later instead.
    #[arg(long, env = "FALLBACK_RATE")]
    pub fallback_rate: Option<Decimal>,

    #[arg(long, env = "PAGE_SIZE", default_value_t = 5)]
    pub page_size: usize,
}

impl DeskConfig {
    pub fn settings(&self) -> Result<DeskSettings> {
        if let Some(rate) = self.fallback_rate {
            anyhow::ensure!(rate > Decimal::ZERO, "FALLBACK_RATE must be positive, got {rate}");
        }
        anyhow::ensure!(self.poll_interval_secs > 0, "POLL_INTERVAL_SECS must be positive");
        Ok(DeskSettings {
            admin_id: self.admin_id,
            commission: Commission::new(self.commission)?,
            page_size: self.page_size,
            watcher: WatcherSettings {
                interval: Duration::from_secs(self.poll_interval_secs),
                user_delay: Duration::from_millis(self.poll_delay_ms),
                fallback_rate: self.fallback_rate,
            },
        })
    }

    pub fn explorer(&self, client: &Client) -> EsploraExplorer {
        EsploraExplorer::new(client.clone(), &self.explorer_url)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        desk: DeskConfig,
    }

    #[test]
    fn defaults() {
        let cli = TestCli::try_parse_from([
            "deposit-desk",
            "--master-key",
            "tprv-placeholder",
            "--admin-id",
            "42",
        ])
        .unwrap();
        let settings = cli.desk.settings().unwrap();
        assert_eq!(settings.admin_id, 42);
        assert_eq!(settings.page_size, 5);
        assert_eq!(settings.commission, Commission::default());
        assert_eq!(settings.watcher.interval, Duration::from_secs(600));
        assert_eq!(settings.watcher.user_delay, Duration::from_secs(1));
        assert_eq!(settings.watcher.fallback_rate, None);
        assert_eq!(cli.desk.key.network, Network::Bitcoin);
        assert_eq!(cli.desk.rates.fiat_currency, "RUB");
        assert_eq!(cli.desk.rates.http_timeout_secs, 10);
    }

    #[test]
    fn rejects_bad_commission() {
        let cli = TestCli::try_parse_from([
            "deposit-desk",
            "--master-key",
            "k",
            "--admin-id",
            "1",
            "--commission",
            "1.5",
        ])
        .unwrap();
        assert!(cli.desk.settings().is_err());
    }
}
