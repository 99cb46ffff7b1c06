//! Per-user dialogue state.
//!
//! Lives only in process memory: a restart forgets where every user was in
//! their dialogue and drops staged withdrawal amounts. Nothing financial
//! depends on it, committed state is always in the store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rust_decimal::Decimal;

use crate::models::UserId;

/// What the next free-text message of a user is taken as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DialogueStep {
    #[default]
    Idle,
    AwaitingCardNumber,
    AwaitingWithdrawAmount,
}

#[derive(Debug, Clone, Default)]
struct Session {
    step: DialogueStep,
    staged_amount: Option<Decimal>,
}

impl Session {
    fn is_blank(&self) -> bool {
        self.step == DialogueStep::Idle && self.staged_amount.is_none()
    }
}

#[derive(Debug, Default)]
pub struct ConversationState {
    sessions: Mutex<HashMap<UserId, Session>>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self, user_id: UserId) -> DialogueStep {
        self.lock()
            .get(&user_id)
            .map(|session| session.step)
            .unwrap_or_default()
    }

    pub fn set_step(&self, user_id: UserId, step: DialogueStep) {
        self.update(user_id, |session| session.step = step);
    }

    /// Stages a withdrawal amount awaiting confirmation and ends the amount prompt.
    pub fn stage_amount(&self, user_id: UserId, amount: Decimal) {
        self.update(user_id, |session| {
            session.staged_amount = Some(amount);
            session.step = DialogueStep::Idle;
        });
    }

    pub fn staged_amount(&self, user_id: UserId) -> Option<Decimal> {
        self.lock()
            .get(&user_id)
            .and_then(|session| session.staged_amount)
    }

    pub fn take_staged_amount(&self, user_id: UserId) -> Option<Decimal> {
        let mut taken = None;
        self.update(user_id, |session| taken = session.staged_amount.take());
        taken
    }

    /// Forgets the dialogue step and any staged amount.
    pub fn reset(&self, user_id: UserId) {
        self.lock().remove(&user_id);
    }

    fn update(&self, user_id: UserId, f: impl FnOnce(&mut Session)) {
        let mut sessions = self.lock();
        let session = sessions.entry(user_id).or_default();
        f(session);
        if session.is_blank() {
            sessions.remove(&user_id);
        }
    }

    // the map holds no financial state, a panic elsewhere must not wedge it
    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
