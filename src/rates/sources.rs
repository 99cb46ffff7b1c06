use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::upstream::{UpstreamError, get_json};

use super::{FiatQuote, FiatRateSource, SpotPriceSource};

const KRAKEN: &str = "kraken";
const KRAKEN_PAIR: &str = "XBTUSD";
// Kraken answers with its legacy asset code as the result key
const KRAKEN_RESULT_KEY: &str = "XXBTZUSD";

/// BTC/USD last-trade price from the Kraken public ticker.
pub struct KrakenTicker {
    client: Client,
    base_url: String,
}

impl KrakenTicker {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KrakenResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, KrakenTick>,
}

#[derive(Debug, Deserialize)]
struct KrakenTick {
    /// `[price, lot volume]` of the last trade
    c: Vec<String>,
}

#[async_trait]
impl SpotPriceSource for KrakenTicker {
    async fn btc_usd(&self) -> Result<Decimal, UpstreamError> {
        let url = format!(
            "{}/0/public/Ticker?pair={KRAKEN_PAIR}",
            self.base_url.trim_end_matches('/')
        );
        let response: KrakenResponse = get_json(&self.client, KRAKEN, &url).await?;
        parse_last_trade(response)
    }
}

fn parse_last_trade(response: KrakenResponse) -> Result<Decimal, UpstreamError> {
    if !response.error.is_empty() {
        return Err(UpstreamError::malformed(KRAKEN, response.error.join("; ")));
    }
    let last = response
        .result
        .get(KRAKEN_RESULT_KEY)
        .and_then(|tick| tick.c.first())
        .ok_or_else(|| UpstreamError::malformed(KRAKEN, "missing last trade price"))?;
    let price: Decimal = last
        .parse()
        .map_err(|_| UpstreamError::malformed(KRAKEN, format!("invalid price `{last}`")))?;
    if price <= Decimal::ZERO {
        return Err(UpstreamError::malformed(KRAKEN, format!("non-positive price {price}")));
    }
    Ok(price)
}

const EXCHANGE_RATE_API: &str = "exchange rate api";

/// USD → `currency` rate from open.er-api.com. The response announces when
/// the next update happens, which is used as the cache expiry.
pub struct ExchangeRateApi {
    client: Client,
    base_url: String,
    currency: String,
}

impl ExchangeRateApi {
    pub fn new(client: Client, base_url: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            currency: currency.into().to_uppercase(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LatestRates {
    result: String,
    #[serde(default)]
    rates: HashMap<String, QuotedRate>,
    time_next_update_unix: i64,
}

/// Rate parsed from the exact digits of the JSON number.
#[derive(Debug, Clone, Copy, Deserialize)]
struct QuotedRate(#[serde(with = "rust_decimal::serde::arbitrary_precision")] Decimal);

#[async_trait]
impl FiatRateSource for ExchangeRateApi {
    async fn usd_rate(&self) -> Result<FiatQuote, UpstreamError> {
        let url = format!("{}/v6/latest/USD", self.base_url.trim_end_matches('/'));
        let response: LatestRates = get_json(&self.client, EXCHANGE_RATE_API, &url).await?;
        parse_quote(response, &self.currency)
    }
}

fn parse_quote(response: LatestRates, currency: &str) -> Result<FiatQuote, UpstreamError> {
    if response.result != "success" {
        return Err(UpstreamError::malformed(
            EXCHANGE_RATE_API,
            format!("result is `{}`", response.result),
        ));
    }
    let QuotedRate(rate) = response.rates.get(currency).copied().ok_or_else(|| {
        UpstreamError::malformed(EXCHANGE_RATE_API, format!("no rate for {currency}"))
    })?;
    if rate <= Decimal::ZERO {
        return Err(UpstreamError::malformed(
            EXCHANGE_RATE_API,
            format!("non-positive rate {rate}"),
        ));
    }
    let valid_until = DateTime::<Utc>::from_timestamp(response.time_next_update_unix, 0)
        .ok_or_else(|| UpstreamError::malformed(EXCHANGE_RATE_API, "invalid next update time"))?;
    Ok(FiatQuote { rate, valid_until })
}

#[cfg(test)]
mod tests {
    use crate::test_support::dec;

    use super::*;

    #[test]
    fn kraken_last_trade() {
        let response: KrakenResponse = serde_json::from_str(
            r#"{"error":[],"result":{"XXBTZUSD":{"a":["1","1","1"],"c":["64012.30000","0.0005"]}}}"#,
        )
        .unwrap();
        assert_eq!(parse_last_trade(response).unwrap(), dec("64012.30000"));
    }

    #[test]
    fn kraken_error_payload() {
        let response: KrakenResponse =
            serde_json::from_str(r#"{"error":["EQuery:Unknown asset pair"],"result":{}}"#).unwrap();
        let err = parse_last_trade(response).unwrap_err();
        assert!(err.to_string().contains("Unknown asset pair"));
    }

    #[test]
    fn exchange_rate_quote() {
        let response: LatestRates = serde_json::from_str(
            r#"{"result":"success","time_next_update_unix":1700003600,"rates":{"USD":1,"RUB":92.5}}"#,
        )
        .unwrap();
        let quote = parse_quote(response, "RUB").unwrap();
        assert_eq!(quote.rate, dec("92.5"));
        assert_eq!(quote.valid_until.timestamp(), 1_700_003_600);
    }

    #[test]
    fn exchange_rate_keeps_every_digit() {
        let response: LatestRates = serde_json::from_str(
            r#"{"result":"success","time_next_update_unix":1700003600,"rates":{"RUB":92.123456789012345678}}"#,
        )
        .unwrap();
        let quote = parse_quote(response, "RUB").unwrap();
        assert_eq!(quote.rate, dec("92.123456789012345678"));
    }

    #[test]
    fn exchange_rate_missing_currency() {
        let response: LatestRates = serde_json::from_str(
            r#"{"result":"success","time_next_update_unix":1700003600,"rates":{"USD":1}}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_quote(response, "RUB"),
            Err(UpstreamError::Malformed { .. })
        ));
    }

    #[test]
    fn exchange_rate_error_result() {
        let response: LatestRates =
            serde_json::from_str(r#"{"result":"error","time_next_update_unix":0}"#).unwrap();
        assert!(parse_quote(response, "RUB").is_err());
    }
}
