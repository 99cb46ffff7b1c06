//! In-process fakes for the upstream services and the chat transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::Network;
use bitcoin::bip32::Xpriv;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use crate::notify::{Event, Notifier, Recipient};
use crate::rates::{FiatQuote, FiatRateSource, SpotPriceSource};
use crate::upstream::UpstreamError;
use crate::wallet::KeyDeriver;
use crate::watcher::{Explorer, ExplorerTx, TxOutput, TxStatus};

pub fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

pub fn test_deriver() -> Arc<KeyDeriver> {
    let master = Xpriv::new_master(Network::Testnet, &[7u8; 32]).unwrap();
    Arc::new(KeyDeriver::new(master, Network::Testnet).unwrap())
}

pub fn explorer_tx(txid: &str, address: &str, sats: u64, confirmed: bool) -> ExplorerTx {
    ExplorerTx {
        txid: txid.to_string(),
        vout: vec![TxOutput {
            scriptpubkey_address: Some(address.to_string()),
            value: sats,
        }],
        status: TxStatus { confirmed },
    }
}

fn unavailable(service: &'static str) -> UpstreamError {
    UpstreamError::Status {
        service,
        status: 503,
        body: "unavailable".to_string(),
    }
}

#[derive(Default)]
pub struct FakeExplorer {
    listings: Mutex<HashMap<String, Vec<ExplorerTx>>>,
    failing: AtomicBool,
}

impl FakeExplorer {
    pub fn set(&self, address: &str, txs: Vec<ExplorerTx>) {
        self.listings.lock().unwrap().insert(address.to_string(), txs);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Explorer for FakeExplorer {
    async fn address_transactions(&self, address: &str) -> Result<Vec<ExplorerTx>, UpstreamError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("explorer"));
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct FakeSpot {
    price: Mutex<Decimal>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl FakeSpot {
    pub fn new(price: Decimal) -> Self {
        Self {
            price: Mutex::new(price),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpotPriceSource for FakeSpot {
    async fn btc_usd(&self) -> Result<Decimal, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("kraken"));
        }
        Ok(*self.price.lock().unwrap())
    }
}

/// Quotes stay valid for `ttl` after each fetch; a negative ttl makes every quote stale.
pub struct FakeFiat {
    rate: Mutex<Decimal>,
    ttl: Duration,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl FakeFiat {
    pub fn new(rate: Decimal, ttl: Duration) -> Self {
        Self {
            rate: Mutex::new(rate),
            ttl,
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_rate(&self, rate: Decimal) {
        *self.rate.lock().unwrap() = rate;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl FiatRateSource for FakeFiat {
    async fn usd_rate(&self) -> Result<FiatQuote, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("exchange rate api"));
        }
        Ok(FiatQuote {
            rate: *self.rate.lock().unwrap(),
            valid_until: Utc::now() + self.ttl,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Recipient, Event)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(Recipient, Event)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: Recipient, event: &Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push((recipient, event.clone()));
        Ok(())
    }
}
