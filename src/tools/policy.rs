//! Per-conversation bookkeeping for the tool invocation policy.
//!
//! The engines never look at conversation history. This ledger does: it
//! remembers which confirmations are pending, which targets were read in the
//! current turn, and how many tool calls the turn has used.

use crate::address::CellRange;
use crate::confirm::Confirmation;
use crate::error::PolicyViolation;
use crate::model::Literal;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Conversation key used when a call carries no thread id.
pub const DEFAULT_CONVERSATION: &str = "default";

const DEFAULT_IDLE_TTL_SECS: u64 = 3600;
const DEFAULT_MAX_PENDING: usize = 32;

/// Bounds on what the ledger keeps in memory.
#[derive(Debug, Clone, Copy)]
pub struct LedgerLimits {
    /// A conversation untouched for this long is dropped with its pending
    /// previews and its step budget.
    pub idle_ttl: Duration,
    /// Pending previews kept per conversation; the oldest go first.
    pub max_pending: usize,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

type Conversations = HashMap<String, Conversation>;

pub struct DispatchLedger {
    max_steps: usize,
    require_confirmation: bool,
    limits: LedgerLimits,
    conversations: Mutex<Conversations>,
}

#[derive(Debug)]
struct Conversation {
    turn: u64,
    steps: usize,
    reads: HashSet<String>,
    /// Oldest first.
    pending: Vec<Confirmation>,
    last_active: Instant,
}

impl Conversation {
    fn new() -> Self {
        Self {
            turn: 0,
            steps: 0,
            reads: HashSet::new(),
            pending: Vec::new(),
            last_active: Instant::now(),
        }
    }
}

/// The conversation under `key`, created on first use and marked active.
fn touch<'m>(conversations: &'m mut Conversations, key: &str) -> &'m mut Conversation {
    let entry = conversations
        .entry(key.to_string())
        .or_insert_with(Conversation::new);
    entry.last_active = Instant::now();
    entry
}

/// What an execute call asks to write.
#[derive(Debug, Clone)]
pub struct ExecuteRequest<'a> {
    pub kind: &'static str,
    pub target: CellRange,
    pub proposal: Vec<Vec<Literal>>,
    pub confirmation_id: Option<&'a str>,
}

impl<'a> ExecuteRequest<'a> {
    fn matches(&self, confirmation: &Confirmation) -> bool {
        confirmation.kind() == self.kind
            && confirmation.target() == self.target
            && confirmation.proposal() == self.proposal
    }
}

impl DispatchLedger {
    pub fn new(max_steps: usize, require_confirmation: bool) -> Self {
        Self {
            max_steps,
            require_confirmation,
            limits: LedgerLimits::default(),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limits(mut self, limits: LedgerLimits) -> Self {
        self.limits = LedgerLimits {
            max_pending: limits.max_pending.max(1),
            ..limits
        };
        self
    }

    /// Lock the map after dropping conversations that went idle.
    fn live(&self) -> MutexGuard<'_, Conversations> {
        let mut conversations = self.conversations.lock();
        let ttl = self.limits.idle_ttl;
        let before = conversations.len();
        conversations.retain(|_, entry| entry.last_active.elapsed() <= ttl);
        let evicted = before - conversations.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle conversations");
        }
        conversations
    }

    /// Conversations currently tracked.
    pub fn conversation_count(&self) -> usize {
        self.live().len()
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Start a new turn: the step budget and the read set reset. Pending
    /// confirmations survive, since the user approves them in a later turn.
    pub fn begin_turn(&self, conversation: &str) -> u64 {
        let mut conversations = self.live();
        let entry = touch(&mut conversations, conversation);
        entry.turn += 1;
        entry.steps = 0;
        entry.reads.clear();
        entry.turn
    }

    /// Count one tool call against the turn's budget.
    pub fn record_step(&self, conversation: &str) -> Result<usize, PolicyViolation> {
        let mut conversations = self.live();
        let entry = touch(&mut conversations, conversation);
        if entry.steps >= self.max_steps {
            return Err(PolicyViolation::StepBudgetExhausted {
                limit: self.max_steps,
            });
        }
        entry.steps += 1;
        Ok(entry.steps)
    }

    pub fn record_read(&self, conversation: &str, target: &CellRange) -> Result<(), PolicyViolation> {
        let mut conversations = self.live();
        let entry = touch(&mut conversations, conversation);
        let key = target.to_string();
        if !entry.reads.insert(key.clone()) {
            return Err(PolicyViolation::DuplicateRead { target: key });
        }
        Ok(())
    }

    /// Forget the turn's reads so the updated data may be read again.
    pub fn resolve_reads(&self, conversation: &str) {
        if let Some(entry) = self.live().get_mut(conversation) {
            entry.reads.clear();
        }
    }

    /// Track a fresh preview. An older pending preview of the same target is
    /// superseded.
    pub fn register(&self, conversation: &str, confirmation: Confirmation) {
        let mut conversations = self.live();
        let entry = touch(&mut conversations, conversation);
        let target = confirmation.target();
        entry.pending.retain(|pending| pending.target() != target);
        entry.pending.push(confirmation);
        let excess = entry.pending.len().saturating_sub(self.limits.max_pending);
        if excess > 0 {
            entry.pending.drain(..excess);
            tracing::debug!(conversation, dropped = excess, "dropped oldest pending previews");
        }
    }

    /// Take the confirmation an execute call consumes.
    ///
    /// Returns `Ok(None)` only when confirmation is not required and nothing
    /// matches; the caller then writes without a snapshot guard.
    pub fn claim(
        &self,
        conversation: &str,
        request: &ExecuteRequest<'_>,
    ) -> Result<Option<Confirmation>, PolicyViolation> {
        let mut conversations = self.live();
        let entry = touch(&mut conversations, conversation);

        if let Some(id) = request.confirmation_id {
            let position = entry
                .pending
                .iter()
                .position(|pending| pending.id() == id)
                .ok_or_else(|| PolicyViolation::UnknownConfirmation {
                    confirmation_id: id.to_string(),
                })?;
            if !request.matches(&entry.pending[position]) {
                return Err(PolicyViolation::ConfirmationMismatch {
                    confirmation_id: id.to_string(),
                });
            }
            return Ok(Some(entry.pending.remove(position)));
        }

        match entry.pending.iter().rposition(|pending| request.matches(pending)) {
            Some(position) => Ok(Some(entry.pending.remove(position))),
            None if self.require_confirmation => Err(PolicyViolation::UnconfirmedExecute {
                target: request.target.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Put back a claimed confirmation whose execute failed without writing.
    pub fn restore(&self, conversation: &str, confirmation: Confirmation) {
        self.register(conversation, confirmation);
    }

    pub fn cancel(
        &self,
        conversation: &str,
        confirmation_id: &str,
    ) -> Result<Confirmation, PolicyViolation> {
        let mut conversations = self.live();
        let unknown = || PolicyViolation::UnknownConfirmation {
            confirmation_id: confirmation_id.to_string(),
        };
        let entry = conversations.get_mut(conversation).ok_or_else(unknown)?;
        entry.last_active = Instant::now();
        let position = entry
            .pending
            .iter()
            .position(|pending| pending.id() == confirmation_id)
            .ok_or_else(unknown)?;
        Ok(entry.pending.remove(position))
    }

    pub fn pending(&self, conversation: &str) -> Vec<Confirmation> {
        self.live()
            .get(conversation)
            .map(|entry| entry.pending.clone())
            .unwrap_or_default()
    }

    pub fn forget(&self, conversation: &str) {
        self.conversations.lock().remove(conversation);
    }
}
