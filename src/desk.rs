use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::command::{DeskCommand, parse_amount, parse_card_number};
use crate::conversation::{ConversationState, DialogueStep};
use crate::error::{DeskError, ErrorKind};
use crate::models::{User, UserId};
use crate::notify::Notifier;
use crate::rates::RateService;
use crate::store::{Store, UserStore};
use crate::wallet::{AddressAllocator, KeyDeriver};
use crate::watcher::{DepositWatcher, Explorer, WatcherSettings};
use crate::withdrawal::{Commission, DEFAULT_PAGE_SIZE, PendingPage, RequestOutcome, WithdrawalWorkflow};

const HELP: &str = "Commands: /card, /address, /check, /balance, /withdraw, /confirm, /cancel";

#[derive(Debug, Clone)]
pub struct DeskSettings {
    pub admin_id: UserId,
    pub commission: Commission,
    pub page_size: usize,
    pub watcher: WatcherSettings,
}

impl DeskSettings {
    pub fn new(admin_id: UserId) -> Self {
        Self {
            admin_id,
            commission: Commission::default(),
            page_size: DEFAULT_PAGE_SIZE,
            watcher: WatcherSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Administrator listing, left to the transport to lay out
    Pending(PendingPage),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Text(text) => f.write_str(text),
            Reply::Pending(page) if page.items.is_empty() => f.write_str("No pending withdrawals"),
            Reply::Pending(page) => {
                write!(f, "Pending withdrawals (page {} of {}):", page.page + 1, page.pages)?;
                for item in &page.items {
                    write!(
                        f,
                        "\n#{} user {} card {} pay out {}",
                        item.withdrawal.id,
                        item.withdrawal.user_id,
                        item.withdrawal.card_number.as_deref().unwrap_or("-"),
                        item.payout
                    )?;
                }
                Ok(())
            }
        }
    }
}

fn text(message: impl Into<String>) -> Reply {
    Reply::Text(message.into())
}

/// Entry point for everything a chat user or the administrator sends.
pub struct Desk {
    store: Arc<dyn Store>,
    conversation: Arc<ConversationState>,
    allocator: AddressAllocator,
    watcher: Arc<DepositWatcher>,
    withdrawals: WithdrawalWorkflow,
    rates: Arc<RateService>,
    admin_id: UserId,
}

impl Desk {
    pub fn new(
        store: Arc<dyn Store>,
        deriver: Arc<KeyDeriver>,
        explorer: Arc<dyn Explorer>,
        rates: Arc<RateService>,
        notifier: Arc<dyn Notifier>,
        settings: DeskSettings,
    ) -> Self {
        let conversation = Arc::new(ConversationState::new());
        let allocator = AddressAllocator::new(store.clone(), deriver, notifier.clone());
        let watcher = Arc::new(DepositWatcher::new(
            store.clone(),
            explorer,
            rates.clone(),
            notifier.clone(),
            settings.watcher,
        ));
        let withdrawals = WithdrawalWorkflow::new(
            store.clone(),
            notifier,
            conversation.clone(),
            settings.commission,
            settings.page_size,
        );
        Self {
            store,
            conversation,
            allocator,
            watcher,
            withdrawals,
            rates,
            admin_id: settings.admin_id,
        }
    }

    /// The scheduler half, to be spawned with [`DepositWatcher::run`].
    pub fn watcher(&self) -> Arc<DepositWatcher> {
        self.watcher.clone()
    }

    pub async fn rate(&self) -> Result<Decimal, DeskError> {
        Ok(self.rates.rate().await?)
    }

    /// Creates the user if unknown and records their payout card.
    pub fn register(&self, user_id: UserId, card_number: Option<&str>) -> Result<User, DeskError> {
        let card_number = card_number.map(parse_card_number).transpose()?;
        let mut uow = self.store.begin()?;
        let mut user = self.ensure_user_in(&mut *uow, user_id)?;
        if card_number.is_some() {
            user.card_number = card_number;
            uow.update_user(&user)?;
        }
        uow.commit()?;
        Ok(user)
    }

    pub async fn handle_message(&self, user_id: UserId, text: &str) -> Result<Reply, DeskError> {
        let user = self.ensure_user(user_id)?;
        match DeskCommand::parse(text) {
            Some(command) => {
                let command = command?;
                if !matches!(command, DeskCommand::ConfirmWithdrawal | DeskCommand::CancelWithdrawal) {
                    self.conversation.set_step(user_id, DialogueStep::Idle);
                }
                tracing::debug!(user_id, ?command, "handling command");
                self.handle_command(user, command).await
            }
            None => self.handle_text(user, text).await,
        }
    }

    async fn handle_command(&self, user: User, command: DeskCommand) -> Result<Reply, DeskError> {
        match command {
            DeskCommand::Start => Ok(text(format!("Welcome! {HELP}"))),
            DeskCommand::Balance => {
                let availability = self.withdrawals.availability(user.id)?;
                Ok(text(format!(
                    "Balance: {}\nPending withdrawal: {}\nAvailable: {}",
                    availability.balance,
                    availability.pending,
                    availability.available()
                )))
            }
            DeskCommand::DepositAddress => {
                if user.card_number.is_none() {
                    return Err(DeskError::Precondition(
                        "Set a payout card with /card before requesting a deposit address"
                            .to_string(),
                    ));
                }
                let wallet = self.allocator.allocate(user.id).await?;
                Ok(text(format!("Your deposit address: {}", wallet.address)))
            }
            DeskCommand::SetCard => {
                self.conversation
                    .set_step(user.id, DialogueStep::AwaitingCardNumber);
                Ok(text("Send your card number"))
            }
            DeskCommand::CheckDeposits => {
                let report = self.watcher.poll_and_credit(user.id).await?;
                if report.deposits.is_empty() {
                    return Ok(text("No new confirmed deposits"));
                }
                let mut reply = format!("Credited {}", report.credited);
                for deposit in &report.deposits {
                    reply.push_str(&format!("\n{} BTC in {}", deposit.amount_btc, deposit.txid));
                }
                Ok(text(reply))
            }
            DeskCommand::Withdraw => {
                let availability = self.withdrawals.begin(user.id).await?;
                self.conversation
                    .set_step(user.id, DialogueStep::AwaitingWithdrawAmount);
                Ok(text(format!(
                    "Available to withdraw: {}\nSend the amount",
                    availability.available()
                )))
            }
            DeskCommand::ConfirmWithdrawal => match self.withdrawals.confirm(user.id).await? {
                RequestOutcome::Created(withdrawal) => Ok(text(format!(
                    "Withdrawal #{} of {} requested",
                    withdrawal.id, withdrawal.amount
                ))),
                RequestOutcome::Amended { withdrawal, .. } => Ok(text(format!(
                    "Withdrawal #{} updated, new amount {}",
                    withdrawal.id, withdrawal.amount
                ))),
            },
            DeskCommand::CancelWithdrawal => {
                if self.withdrawals.cancel(user.id) {
                    Ok(text("Canceled"))
                } else {
                    Ok(text("Nothing to cancel"))
                }
            }
            DeskCommand::PendingWithdrawals { page } => {
                self.require_admin(&user, "list pending withdrawals")?;
                Ok(Reply::Pending(self.withdrawals.pending_page(page)?))
            }
            DeskCommand::SettleWithdrawal { id } => {
                self.require_admin(&user, "settle withdrawals")?;
                let withdrawal = self.withdrawals.admin_settle(id).await?;
                Ok(text(format!(
                    "Withdrawal #{} of {} settled",
                    withdrawal.id, withdrawal.amount
                )))
            }
            DeskCommand::RevealKey { address } => {
                self.require_admin(&user, "reveal private keys")?;
                let key = self.allocator.reveal_key(&address)?;
                Ok(text(format!("Private key of {address}: {key}")))
            }
        }
    }

    async fn handle_text(&self, user: User, input: &str) -> Result<Reply, DeskError> {
        match self.conversation.step(user.id) {
            DialogueStep::Idle => Ok(text(HELP)),
            DialogueStep::AwaitingCardNumber => {
                let card_number = parse_card_number(input)?;
                self.register(user.id, Some(&card_number))?;
                self.conversation.set_step(user.id, DialogueStep::Idle);
                Ok(text(format!("Card {card_number} saved")))
            }
            DialogueStep::AwaitingWithdrawAmount => {
                // a malformed amount keeps the prompt open
                let amount = parse_amount(input)?;
                match self.withdrawals.stage(user.id, amount).await {
                    Ok(_) => Ok(text(format!(
                        "Withdraw {amount} to card {}? /confirm or /cancel",
                        user.card_number.as_deref().unwrap_or("-")
                    ))),
                    Err(err) => {
                        if err.kind() == ErrorKind::InsufficientFunds {
                            self.conversation.set_step(user.id, DialogueStep::Idle);
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    fn require_admin(&self, user: &User, action: &'static str) -> Result<(), DeskError> {
        if user.is_admin {
            Ok(())
        } else {
            tracing::warn!(user_id = user.id, action, "administrator action refused");
            Err(DeskError::Forbidden { action })
        }
    }

    fn ensure_user(&self, user_id: UserId) -> Result<User, DeskError> {
        let mut uow = self.store.begin()?;
        let user = self.ensure_user_in(&mut *uow, user_id)?;
        uow.commit()?;
        Ok(user)
    }

    fn ensure_user_in<S>(&self, uow: &mut S, user_id: UserId) -> Result<User, DeskError>
    where
        S: UserStore + ?Sized,
    {
        let is_admin = user_id == self.admin_id;
        match uow.get_user(user_id)? {
            Some(mut user) => {
                if is_admin && !user.is_admin {
                    user.is_admin = true;
                    uow.update_user(&user)?;
                }
                Ok(user)
            }
            None => {
                let user = User::new(user_id, is_admin);
                uow.create_user(user.clone())?;
                tracing::info!(user_id, is_admin, "new user");
                Ok(user)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::command::CommandError;
    use crate::store::in_memory::InMemoryStore;
    use crate::test_support::{
        FakeExplorer, FakeFiat, FakeSpot, RecordingNotifier, explorer_tx, test_deriver,
    };

    use super::*;

    const ADMIN: UserId = 100;

    fn desk() -> (Desk, Arc<FakeExplorer>) {
        let explorer = Arc::new(FakeExplorer::default());
        let rates = Arc::new(RateService::new(
            Arc::new(FakeSpot::new(Decimal::from(40_000))),
            Arc::new(FakeFiat::new(Decimal::from(100), Duration::hours(1))),
        ));
        let mut settings = DeskSettings::new(ADMIN);
        settings.watcher.user_delay = std::time::Duration::ZERO;
        let desk = Desk::new(
            Arc::new(InMemoryStore::new()),
            test_deriver(),
            explorer.clone(),
            rates,
            Arc::new(RecordingNotifier::default()),
            settings,
        );
        (desk, explorer)
    }

    async fn say(desk: &Desk, user_id: UserId, input: &str) -> Result<String, DeskError> {
        desk.handle_message(user_id, input).await.map(|reply| reply.to_string())
    }

    #[tokio::test]
    async fn address_requires_card() {
        let (desk, _) = desk();
        let err = say(&desk, 1, "/address").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        say(&desk, 1, "/card").await.unwrap();
        let err = say(&desk, 1, "12ab").await.unwrap_err();
        assert!(matches!(err, DeskError::Command(CommandError::InvalidCardNumber)));
        assert_eq!(
            say(&desk, 1, "4000 1234 1234 1234").await.unwrap(),
            "Card 4000123412341234 saved"
        );

        let first = say(&desk, 1, "/address").await.unwrap();
        assert!(first.starts_with("Your deposit address: "));
        assert_eq!(say(&desk, 1, "/address").await.unwrap(), first);
    }

    #[tokio::test]
    async fn deposit_then_withdraw_then_settle() {
        let (desk, explorer) = desk();
        desk.register(1, Some("4000123412341234")).unwrap();
        let address = say(&desk, 1, "/address").await.unwrap();
        let address = address.trim_start_matches("Your deposit address: ");
        explorer.set(address, vec![explorer_tx("t1", address, 100_000, true)]);

        assert_eq!(
            say(&desk, 1, "/check").await.unwrap(),
            "Credited 4000.00\n0.00100000 BTC in t1"
        );
        assert_eq!(
            say(&desk, 1, "/check").await.unwrap(),
            "No new confirmed deposits"
        );

        say(&desk, 1, "/withdraw").await.unwrap();
        assert!(say(&desk, 1, "abc").await.is_err());
        // the prompt is still open after a malformed amount
        say(&desk, 1, "1500,5").await.unwrap();
        assert_eq!(
            say(&desk, 1, "/confirm").await.unwrap(),
            "Withdrawal #1 of 1500.5 requested"
        );

        assert_eq!(
            say(&desk, 1, "/settle 1").await.unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        let listing = desk.handle_message(ADMIN, "/pending").await.unwrap();
        assert!(matches!(&listing, Reply::Pending(page) if page.items.len() == 1));
        assert_eq!(
            say(&desk, ADMIN, "/settle 1").await.unwrap(),
            "Withdrawal #1 of 1500.5 settled"
        );
        assert!(say(&desk, 1, "/balance").await.unwrap().starts_with("Balance: 2499.50"));
        assert_eq!(
            say(&desk, ADMIN, "/settle 1").await.unwrap_err().kind(),
            ErrorKind::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn empty_balance_cannot_open_withdrawal() {
        let (desk, _) = desk();
        desk.register(1, Some("4000123412341234")).unwrap();
        let err = say(&desk, 1, "/withdraw").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(say(&desk, 1, "25").await.unwrap(), HELP);
    }

    #[tokio::test]
    async fn admin_reveals_keys() {
        let (desk, _) = desk();
        desk.register(1, Some("4000123412341234")).unwrap();
        let address = say(&desk, 1, "/address").await.unwrap();
        let address = address.trim_start_matches("Your deposit address: ").to_string();

        let command = format!("/key {address}");
        assert_eq!(
            say(&desk, 1, &command).await.unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        let expected = test_deriver().derive(0).unwrap().private_key;
        assert!(say(&desk, ADMIN, &command).await.unwrap().ends_with(&expected));
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let (desk, _) = desk();
        let err = say(&desk, 1, "/launch").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(say(&desk, 1, "hello").await.unwrap(), HELP);
    }
}
