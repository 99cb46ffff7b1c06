//! BTC → local currency conversion rate.
//!
//! The rate is the product of two independent lookups: a BTC/USD spot price
//! and a USD/local-currency rate. Both are requested concurrently. The
//! USD/local rate is cached until the `valid_until` instant announced by the
//! upstream API; the spot price is always fetched fresh.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::upstream::UpstreamError;

mod sources;

pub use sources::{ExchangeRateApi, KrakenTicker};

#[async_trait]
pub trait SpotPriceSource: Send + Sync {
    /// Last traded BTC price in USD.
    async fn btc_usd(&self) -> Result<Decimal, UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiatQuote {
    /// Units of local currency per 1 USD
    pub rate: Decimal,
    /// Instant until which the upstream promises the rate will not change
    pub valid_until: DateTime<Utc>,
}

#[async_trait]
pub trait FiatRateSource: Send + Sync {
    async fn usd_rate(&self) -> Result<FiatQuote, UpstreamError>;
}

pub struct RateService {
    spot: Arc<dyn SpotPriceSource>,
    fiat: Arc<dyn FiatRateSource>,
    cached: Mutex<Option<FiatQuote>>,
}

impl RateService {
    pub fn new(spot: Arc<dyn SpotPriceSource>, fiat: Arc<dyn FiatRateSource>) -> Self {
        Self {
            spot,
            fiat,
            cached: Mutex::new(None),
        }
    }

    /// Local-currency price of one BTC.
    ///
    /// A failure of either lookup fails the whole call; no fallback value is
    /// substituted here.
    pub async fn rate(&self) -> Result<Decimal, UpstreamError> {
        let (btc_usd, usd_local) = tokio::try_join!(self.spot.btc_usd(), self.usd_rate())?;
        let rate = btc_usd * usd_local;
        tracing::debug!(%btc_usd, %usd_local, %rate, "computed exchange rate");
        Ok(rate)
    }

    async fn usd_rate(&self) -> Result<Decimal, UpstreamError> {
        // held across the refetch so concurrent misses trigger one request
        let mut cached = self.cached.lock().await;
        if let Some(quote) = *cached {
            if Utc::now() < quote.valid_until {
                tracing::trace!("using cached USD rate");
                return Ok(quote.rate);
            }
        }

        let quote = self.fiat.usd_rate().await?;
        if quote.rate <= Decimal::ZERO {
            return Err(UpstreamError::malformed(
                "exchange rate api",
                format!("non-positive rate {}", quote.rate),
            ));
        }
        tracing::info!(rate = %quote.rate, valid_until = %quote.valid_until, "refreshed USD rate");
        *cached = Some(quote);
        Ok(quote.rate)
    }
}
