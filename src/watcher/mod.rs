//! Detection and crediting of on-chain deposits.
//!
//! A poll lists the transactions of the user's deposit address and records
//! each one that pays the address, keyed by txid. A recorded transaction is
//! credited once, the first time it is observed confirmed; unconfirmed
//! sightings are recorded but wait for a later poll. Recording and crediting
//! happen in one unit of work, so a failure in between leaves nothing behind
//! and the next poll starts over.
//!
//! A txid is owned by the first user it was recorded for. When a later poll
//! finds the same txid paying another watched address, that sighting is
//! skipped and reported to the administrator on every poll until reconciled.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{DeskError, ErrorKind};
use crate::ledger;
use crate::models::{DepositTransaction, SystemWallet, UserId};
use crate::notify::{Event, Notifier, Recipient, alert_on_violation, deliver};
use crate::rates::RateService;
use crate::runtime::Shutdown;
use crate::store::Store;

mod explorer;

pub use explorer::{EsploraExplorer, Explorer, ExplorerTx, TxOutput, TxStatus};

const SATS_SCALE: u32 = 8;
/// Local-currency amounts are kept with this many fractional digits.
pub const LOCAL_SCALE: u32 = 2;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub interval: Duration,
    /// Pause between two users of one sweep, throttles explorer usage
    pub user_delay: Duration,
    /// Rate used when the rate service is unavailable. `None` aborts the poll instead.
    pub fallback_rate: Option<Decimal>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            user_delay: Duration::from_secs(1),
            fallback_rate: None,
        }
    }
}

pub struct DepositWatcher {
    store: Arc<dyn Store>,
    explorer: Arc<dyn Explorer>,
    rates: Arc<RateService>,
    notifier: Arc<dyn Notifier>,
    settings: WatcherSettings,
}

/// A transaction credited by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditedDeposit {
    pub txid: String,
    pub amount_btc: Decimal,
}

/// What one poll added to the user's balance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Local-currency amount added to the balance
    pub credited: Decimal,
    pub deposits: Vec<CreditedDeposit>,
}

/// One transaction paying the watched address, as seen in this poll.
#[derive(Debug, Clone)]
struct Sighting {
    txid: String,
    amount_btc: Decimal,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct Applied {
    credited_txs: Vec<Sighting>,
    amount_btc: Decimal,
    credited: Decimal,
    balance: Decimal,
    card_number: Option<String>,
    conflicts: Vec<DeskError>,
}

impl DepositWatcher {
    pub fn new(
        store: Arc<dyn Store>,
        explorer: Arc<dyn Explorer>,
        rates: Arc<RateService>,
        notifier: Arc<dyn Notifier>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            store,
            explorer,
            rates,
            notifier,
            settings,
        }
    }

    /// Credits every confirmed, not yet credited deposit to the user's
    /// address. Consistency violations are also forwarded to the administrator.
    pub async fn poll_and_credit(&self, user_id: UserId) -> Result<PollReport, DeskError> {
        let polled = self.poll(user_id).await;
        if let Err(err) = &polled {
            alert_on_violation(self.notifier.as_ref(), err).await;
        }
        polled
    }

    async fn poll(&self, user_id: UserId) -> Result<PollReport, DeskError> {
        let wallet = self.watched_wallet(user_id)?;
        let listing = self.explorer.address_transactions(&wallet.address).await?;
        let sightings = sightings(&listing, &wallet.address);
        if sightings.is_empty() {
            return Ok(PollReport::default());
        }

        let rate = if self.has_creditable(user_id, &sightings)? {
            Some(self.rate().await?)
        } else {
            None
        };

        let applied = self.record_and_credit(user_id, &wallet.address, &sightings, rate)?;
        for conflict in &applied.conflicts {
            alert_on_violation(self.notifier.as_ref(), conflict).await;
        }
        if applied.credited_txs.is_empty() {
            return Ok(PollReport::default());
        }

        for tx in &applied.credited_txs {
            let event = Event::DepositReceived {
                user_id,
                address: wallet.address.clone(),
                txid: tx.txid.clone(),
                amount_btc: tx.amount_btc,
                card_number: applied.card_number.clone(),
            };
            deliver(self.notifier.as_ref(), Recipient::Admin, event).await;
        }
        let event = Event::DepositCredited {
            amount_btc: applied.amount_btc,
            credited: applied.credited,
            balance: applied.balance,
        };
        deliver(self.notifier.as_ref(), Recipient::User(user_id), event).await;

        Ok(PollReport {
            credited: applied.credited,
            deposits: applied
                .credited_txs
                .into_iter()
                .map(|tx| CreditedDeposit {
                    txid: tx.txid,
                    amount_btc: tx.amount_btc,
                })
                .collect(),
        })
    }

    fn watched_wallet(&self, user_id: UserId) -> Result<SystemWallet, DeskError> {
        let uow = self.store.begin()?;
        let user = uow
            .get_user(user_id)?
            .ok_or_else(|| DeskError::not_found("user", user_id))?;
        let wallet_id = user
            .wallet_id
            .ok_or_else(|| DeskError::not_found("deposit address of user", user_id))?;
        uow.get_wallet(wallet_id)?.ok_or_else(|| {
            DeskError::consistency(format!(
                "user {user_id} references missing wallet {wallet_id}"
            ))
        })
    }

    fn has_creditable(&self, user_id: UserId, sightings: &[Sighting]) -> Result<bool, DeskError> {
        let uow = self.store.begin()?;
        for sighting in sightings.iter().filter(|s| s.confirmed) {
            let settled = uow
                .get_transaction(&sighting.txid)?
                .is_some_and(|tx| tx.credited || tx.user_id != user_id);
            if !settled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn rate(&self) -> Result<Decimal, DeskError> {
        match self.rates.rate().await {
            Ok(rate) => Ok(rate),
            Err(err) => match self.settings.fallback_rate {
                Some(fallback) => {
                    tracing::warn!(error = %err, %fallback, "rate unavailable, crediting at fallback rate");
                    Ok(fallback)
                }
                None => Err(err.into()),
            },
        }
    }

    fn record_and_credit(
        &self,
        user_id: UserId,
        address: &str,
        sightings: &[Sighting],
        rate: Option<Decimal>,
    ) -> Result<Applied, DeskError> {
        let mut uow = self.store.begin()?;
        let mut applied = Applied::default();

        for sighting in sightings {
            let mut record = match uow.get_transaction(&sighting.txid)? {
                Some(existing) if existing.user_id != user_id => {
                    applied.conflicts.push(DeskError::consistency(format!(
                        "transaction {} is recorded for user {} but also pays {} BTC to user {user_id} at {address}, not credited",
                        existing.txid, existing.user_id, sighting.amount_btc
                    )));
                    continue;
                }
                Some(existing) if existing.credited => continue,
                Some(existing) => existing,
                None => {
                    let record = DepositTransaction {
                        txid: sighting.txid.clone(),
                        user_id,
                        address: address.to_string(),
                        amount_btc: sighting.amount_btc,
                        confirmed: sighting.confirmed,
                        credited: false,
                        seen_at: Utc::now(),
                    };
                    uow.insert_transaction(record.clone())?;
                    tracing::info!(user_id, txid = %record.txid, amount_btc = %record.amount_btc, confirmed = record.confirmed, "recorded deposit");
                    record
                }
            };
            if !sighting.confirmed {
                continue;
            }
            record.confirmed = true;
            record.credited = true;
            uow.update_transaction(&record)?;
            applied.amount_btc += record.amount_btc;
            applied.credited_txs.push(sighting.clone());
        }

        if applied.credited_txs.is_empty() {
            uow.commit()?;
            return Ok(applied);
        }

        let rate = rate.ok_or_else(|| {
            DeskError::consistency(format!("deposit for user {user_id} became creditable without a rate"))
        })?;
        applied.credited = to_local(applied.amount_btc, rate);
        let user = uow
            .get_user(user_id)?
            .ok_or_else(|| DeskError::not_found("user", user_id))?;
        applied.card_number = user.card_number;
        applied.balance = if applied.credited > Decimal::ZERO {
            ledger::credit(&mut *uow, user_id, applied.credited)?
        } else {
            tracing::warn!(user_id, amount_btc = %applied.amount_btc, "deposit too small to credit");
            user.balance
        };
        uow.commit()?;

        tracing::info!(
            user_id,
            amount_btc = %applied.amount_btc,
            %rate,
            credited = %applied.credited,
            balance = %applied.balance,
            "credited deposit"
        );
        Ok(applied)
    }

    /// One sweep over every user holding a deposit address. Failures are
    /// logged per user and never stop the sweep.
    pub async fn poll_all(&self, shutdown: &Shutdown) {
        let users = match self.store.begin().and_then(|uow| uow.users_with_wallets()) {
            Ok(users) => users,
            Err(err) => {
                tracing::error!(error = %err, "cannot list watched users");
                return;
            }
        };
        tracing::debug!(users = users.len(), "polling deposit addresses");

        for (position, user) in users.iter().enumerate() {
            if shutdown.is_triggered() {
                return;
            }
            if position > 0 && !self.settings.user_delay.is_zero() {
                tokio::time::sleep(self.settings.user_delay).await;
            }
            match self.poll_and_credit(user.id).await {
                Ok(report) if !report.deposits.is_empty() => {
                    tracing::debug!(user_id = user.id, credited = %report.credited, deposits = report.deposits.len(), "poll credited deposits")
                }
                Ok(_) => {}
                Err(err) => match err.kind() {
                    ErrorKind::NotFound => {
                        tracing::debug!(user_id = user.id, error = %err, "skipping user this cycle")
                    }
                    ErrorKind::UpstreamUnavailable => {
                        tracing::warn!(user_id = user.id, error = %err, "poll failed, retrying next cycle")
                    }
                    _ => tracing::error!(user_id = user.id, error = %err, "poll failed"),
                },
            }
        }
    }

    /// Sweeps every `interval` until `shutdown` fires. The first sweep
    /// happens one interval after start.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        let period = self.settings.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = period.as_secs(), "deposit watcher started");

        loop {
            if shutdown.is_triggered() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.poll_all(&shutdown).await,
                _ = stop.recv() => break,
            }
        }
        tracing::info!("deposit watcher stopped");
    }
}

fn sightings(listing: &[ExplorerTx], address: &str) -> Vec<Sighting> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for tx in listing {
        if !seen.insert(tx.txid.as_str()) {
            continue;
        }
        let sats = tx.received_by(address);
        if sats == 0 {
            if tx.vout.iter().any(|out| out.scriptpubkey_address.as_deref() == Some(address)) {
                tracing::debug!(txid = %tx.txid, "ignoring zero-value output");
            }
            continue;
        }
        result.push(Sighting {
            txid: tx.txid.clone(),
            amount_btc: sats_to_btc(sats),
            confirmed: tx.status.confirmed,
        });
    }
    result
}

pub fn sats_to_btc(sats: u64) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(sats), SATS_SCALE)
}

/// Converts BTC to local currency, truncating to [`LOCAL_SCALE`] digits so
/// a deposit is never over-credited.
pub fn to_local(amount_btc: Decimal, rate: Decimal) -> Decimal {
    (amount_btc * rate).round_dp_with_strategy(LOCAL_SCALE, RoundingStrategy::ToZero)
}
