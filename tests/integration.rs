use std::collections::{BTreeSet, HashMap};
use std::str::from_utf8;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Network;
use bitcoin::bip32::Xpriv;
use chrono::Utc;
use deposit_desk::bin_utils::{Service, import_users};
use deposit_desk::conversation::ConversationState;
use deposit_desk::desk::{Desk, DeskSettings};
use deposit_desk::models::{User, UserId};
use deposit_desk::notify::TracingNotifier;
use deposit_desk::rates::{FiatQuote, FiatRateSource, RateService, SpotPriceSource};
use deposit_desk::runtime::Shutdown;
use deposit_desk::store::in_memory::InMemoryStore;
use deposit_desk::store::{Store, UserStore};
use deposit_desk::upstream::UpstreamError;
use deposit_desk::wallet::{AddressAllocator, KeyDeriver};
use deposit_desk::watcher::{
    DepositWatcher, Explorer, ExplorerTx, TxOutput, TxStatus, WatcherSettings,
};
use deposit_desk::withdrawal::{Commission, WithdrawalWorkflow};
use rust_decimal::Decimal;

const USERS: &str = include_str!("users.csv");
const CONVERSATION: &str = include_str!("conversation.txt");
const ADMIN: i64 = 100;

/// Every address has received one confirmed 0.001 BTC transaction.
struct OneDepositEach;

#[async_trait]
impl Explorer for OneDepositEach {
    async fn address_transactions(&self, address: &str) -> Result<Vec<ExplorerTx>, UpstreamError> {
        Ok(vec![ExplorerTx {
            txid: format!("tx-{address}"),
            vout: vec![TxOutput {
                scriptpubkey_address: Some(address.to_string()),
                value: 100_000,
            }],
            status: TxStatus { confirmed: true },
        }])
    }
}

struct FixedSpot;

#[async_trait]
impl SpotPriceSource for FixedSpot {
    async fn btc_usd(&self) -> Result<Decimal, UpstreamError> {
        Ok(Decimal::from(40_000))
    }
}

struct FixedFiat;

#[async_trait]
impl FiatRateSource for FixedFiat {
    async fn usd_rate(&self) -> Result<FiatQuote, UpstreamError> {
        Ok(FiatQuote {
            rate: Decimal::from(100),
            valid_until: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

fn deriver() -> Arc<KeyDeriver> {
    let master = Xpriv::new_master(Network::Testnet, &[42u8; 32]).unwrap();
    Arc::new(KeyDeriver::new(master, Network::Testnet).unwrap())
}

fn rates() -> Arc<RateService> {
    Arc::new(RateService::new(Arc::new(FixedSpot), Arc::new(FixedFiat)))
}

fn desk() -> Desk {
    let mut settings = DeskSettings::new(ADMIN);
    settings.watcher.user_delay = Duration::ZERO;
    Desk::new(
        Arc::new(InMemoryStore::new()),
        deriver(),
        Arc::new(OneDepositEach),
        rates(),
        Arc::new(TracingNotifier),
        settings,
    )
}

#[tokio::test]
async fn scripted_conversation() {
    let desk = Arc::new(desk());
    assert_eq!(import_users(&desk, USERS.as_bytes()).unwrap(), 2);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let recorded = errors.clone();
    let mut output = Vec::new();
    let service = Service {
        desk,
        input: CONVERSATION.as_bytes(),
        output: &mut output,
        error_printer: Box::new(move |line, err| {
            recorded.lock().unwrap().push(format!("{line}: {err}"))
        }),
        shutdown: Shutdown::new(),
    };
    service.run().await.unwrap();

    let output = from_utf8(&output).unwrap();
    let expected = [
        "[1] Welcome!",
        "[1] Your deposit address: ",
        "[1] Credited 4000.00\n0.00100000 BTC in tx-",
        "[1] No new confirmed deposits",
        "[1] Available to withdraw: 4000.00",
        "[1] Withdraw 1500 to card 4000123412341234? /confirm or /cancel",
        "[1] Withdrawal #1 of 1500 requested",
        "[1] Available to withdraw: 2500.00",
        "[1] Insufficient funds: requested 2600, available 2500.00",
        "[1] Balance: 4000.00\nPending withdrawal: 1500\nAvailable: 2500.00",
        "[2] Insufficient funds",
        "[100] page 1 of 1\nid,user,card_number,amount,payout,created_at\n1,1,4000123412341234,1500,1410.00,",
        "[1] Only the administrator can settle withdrawals",
        "[100] Withdrawal #1 of 1500 settled",
        "[100] Withdrawal #1 is already completed",
        "[1] Balance: 2500.00\nPending withdrawal: 0\nAvailable: 2500.00",
    ];
    let mut rest = output;
    for fragment in expected {
        let at = rest
            .find(fragment)
            .unwrap_or_else(|| panic!("`{fragment}` missing from:\n{output}"));
        rest = &rest[at + fragment.len()..];
    }

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("12: "));
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let shutdown = Shutdown::new();
    shutdown.trigger();
    let mut output = Vec::new();
    let service = Service {
        desk: Arc::new(desk()),
        input: CONVERSATION.as_bytes(),
        output: &mut output,
        error_printer: Box::new(|_, _| {}),
        shutdown,
    };
    service.run().await.unwrap();
    assert!(output.is_empty());
}

#[test]
fn malformed_user_file_is_reported_with_its_line() {
    let desk = desk();
    let err = import_users(&desk, "user,card_number\n1,4000123412341234\n2,12\n".as_bytes())
        .unwrap_err();
    assert!(err.to_string().contains("line 3"));
}

struct Components {
    store: Arc<InMemoryStore>,
    allocator: Arc<AddressAllocator>,
    watcher: Arc<DepositWatcher>,
    withdrawals: Arc<WithdrawalWorkflow>,
}

fn components(users: &[(UserId, i64)]) -> Components {
    let store = Arc::new(InMemoryStore::new());
    {
        let mut uow = store.begin().unwrap();
        for (id, balance) in users {
            let mut user = User::new(*id, false);
            user.balance = Decimal::from(*balance);
            user.card_number = Some("4000123412341234".to_string());
            uow.create_user(user).unwrap();
        }
        uow.commit().unwrap();
    }
    let notifier = Arc::new(TracingNotifier);
    let settings = WatcherSettings {
        user_delay: Duration::ZERO,
        ..WatcherSettings::default()
    };
    Components {
        allocator: Arc::new(AddressAllocator::new(
            store.clone(),
            deriver(),
            notifier.clone(),
        )),
        watcher: Arc::new(DepositWatcher::new(
            store.clone(),
            Arc::new(OneDepositEach),
            rates(),
            notifier.clone(),
            settings,
        )),
        withdrawals: Arc::new(WithdrawalWorkflow::new(
            store.clone(),
            notifier,
            Arc::new(ConversationState::new()),
            Commission::default(),
            5,
        )),
        store,
    }
}

fn balance(store: &InMemoryStore, user_id: UserId) -> Decimal {
    store.begin().unwrap().get_user(user_id).unwrap().unwrap().balance
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_credits_and_settlement_keep_every_change() {
    for _ in 0..20 {
        let c = components(&[(1, 1000)]);
        c.allocator.allocate(1).await.unwrap();
        let id = c
            .withdrawals
            .request_or_amend(1, Decimal::from(300))
            .await
            .unwrap()
            .withdrawal()
            .id;

        let mut polls = Vec::new();
        for _ in 0..6 {
            let watcher = c.watcher.clone();
            polls.push(tokio::spawn(async move { watcher.poll_and_credit(1).await }));
        }
        let withdrawals = c.withdrawals.clone();
        let settle = tokio::spawn(async move { withdrawals.admin_settle(id).await });

        let mut credited = Decimal::ZERO;
        for poll in polls {
            credited += poll.await.unwrap().unwrap().credited;
        }
        settle.await.unwrap().unwrap();

        // the deposit lands once, the settlement debits once
        assert_eq!(credited, Decimal::from(4000));
        assert_eq!(balance(&c.store, 1), Decimal::from(1000 + 4000 - 300));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_get_distinct_contiguous_indices() {
    let users: Vec<(UserId, i64)> = (1..=16).map(|id| (id, 0)).collect();
    let c = components(&users);

    let mut tasks = Vec::new();
    for (user_id, _) in &users {
        // every user asks twice, racing everyone else
        for _ in 0..2 {
            let allocator = c.allocator.clone();
            let user_id = *user_id;
            tasks.push(tokio::spawn(async move {
                (user_id, allocator.allocate(user_id).await.unwrap())
            }));
        }
    }
    let mut assigned = HashMap::new();
    for task in tasks {
        let (user_id, wallet) = task.await.unwrap();
        let previous = assigned.insert(user_id, wallet.clone());
        if let Some(previous) = previous {
            assert_eq!(previous, wallet);
        }
    }

    let indices: BTreeSet<_> = assigned.values().map(|w| w.derivation_index).collect();
    assert_eq!(indices, (0..16u32).collect::<BTreeSet<_>>());
    let addresses: BTreeSet<_> = assigned.values().map(|w| w.address.clone()).collect();
    assert_eq!(addresses.len(), 16);
}
