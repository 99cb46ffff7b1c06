/// Entities shared by every component: users, wallets, deposits, withdrawals.
pub mod models;

/// Balance state machine. Commands are validated into events, events mutate the balance.
pub mod account;

/// Parsing of chat commands, money amounts and card numbers.
pub mod command;

/// Persistence interfaces, one narrow trait per entity, plus the unit of work
/// that makes multi-entity changes atomic.
pub mod store;

/// Credit and debit of user balances on top of [`account`].
pub mod ledger;

pub mod error;

pub mod upstream;

/// BTC to local currency rate with a cached USD leg.
pub mod rates;

/// Deterministic deposit addresses derived from the master key.
pub mod wallet;

/// Polling of deposit addresses and crediting of confirmed deposits.
pub mod watcher;

pub mod withdrawal;

pub mod conversation;

/// Events sent out to users and the administrator.
pub mod notify;

/// Routes incoming chat messages to the components above.
pub mod desk;

pub mod runtime;

/// Bootstrap of the desk for the binary. Kept in the library so the
/// integration tests can drive it too.
pub mod bin_utils;

#[cfg(test)]
mod test_support;
