//! Round state machine
//!
//! Drives a round through Collect -> Agree -> SelectKeeper -> Settle ->
//! Finalize, with bounded loops back on timeouts and empty agreements.
//!
//! The machine performs no IO. Every input (delivered bundles, settlement
//! reports, clock ticks) returns the [`Action`]s the caller must carry out,
//! which keeps each agent's transitions a deterministic function of what the
//! replication substrate delivered.

use crate::config::ProtocolConfig;
use crate::error::{ConsensusError, Result};
use crate::keeper::KeeperSelector;
use crate::payload_store::PayloadStore;
use crate::quorum::QuorumEvaluator;
use crate::types::{
    AttemptStatus, Checkpoint, Outcome, OutcomeHash, ParticipantId, ParticipantSet, PayloadBundle, RoundId,
    RoundKind, SettlementAttempt, SettlementNotice, TaskId, TxHash,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Transitions kept for inspection
const HISTORY_LIMIT: usize = 256;

/// Bundles for future rounds kept per participant
const EARLY_BUNDLES_PER_PARTICIPANT: usize = 4;

/// Settlement notices for future attempts kept per participant
const EARLY_NOTICES_PER_PARTICIPANT: usize = 4;

/// The active round
#[derive(Debug, Clone)]
pub struct Round {
    pub id: RoundId,
    pub kind: RoundKind,
    pub start_time: Instant,
    pub deadline: Instant,
    pub payloads: PayloadStore,
    /// Set once agreement is reached
    pub outcome: Option<Outcome>,
}

impl Round {
    fn new(id: RoundId, batch: BTreeSet<TaskId>, now: Instant, timeout: Duration) -> Self {
        Self {
            id,
            kind: RoundKind::Collect,
            start_time: now,
            deadline: now + timeout,
            payloads: PayloadStore::new(id, batch),
            outcome: None,
        }
    }
}

/// Bounded retry counters for the active round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    pub collect_extensions: u32,
    pub agreement_retries: u32,
    pub keeper_failures: u32,
}

/// Why a round was abandoned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    CollectAttemptsExhausted,
    AgreementRetriesExhausted,
    KeeperRetriesExhausted,
    SettlementRejected(String),
}

impl AbandonReason {
    /// Whether the round's tasks go back to the pending queue
    pub fn requeues_tasks(&self) -> bool {
        !matches!(self, AbandonReason::SettlementRejected(_))
    }
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::CollectAttemptsExhausted => f.write_str("no quorum within collect attempts"),
            AbandonReason::AgreementRetriesExhausted => f.write_str("no task resolved within agreement retries"),
            AbandonReason::KeeperRetriesExhausted => f.write_str("keeper retries exhausted"),
            AbandonReason::SettlementRejected(reason) => write!(f, "settlement rejected: {}", reason),
        }
    }
}

/// What the settlement target reported for an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementReport {
    Confirmed { tx_hash: TxHash },
    TimedOut,
    Rejected { reason: String },
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the local provider over these tasks and broadcast a bundle
    ExecuteTasks { round_id: RoundId, tasks: Vec<TaskId> },

    /// A keeper was elected for an attempt
    KeeperElected {
        round_id: RoundId,
        attempt_number: u32,
        keeper: ParticipantId,
    },

    /// This agent is the keeper: submit the batched settlement
    SubmitSettlement {
        round_id: RoundId,
        attempt_number: u32,
        outcome: Outcome,
        /// Earlier attempts of this round that reached the target; check these before submitting
        prior_submissions: Vec<(u32, TxHash)>,
    },

    /// Broadcast that the settlement was submitted
    AnnounceSettlement(SettlementNotice),

    /// Poll the target for inclusion of a submitted transaction
    TrackSettlement {
        round_id: RoundId,
        attempt_number: u32,
        tx_hash: TxHash,
    },

    PersistCheckpoint(Checkpoint),

    RoundFinalized {
        round_id: RoundId,
        outcome_hash: OutcomeHash,
        resubmission_skipped: bool,
        settled_tasks: usize,
    },

    RoundAbandoned {
        round_id: RoundId,
        reason: AbandonReason,
        tasks: Vec<TaskId>,
    },
}

/// Serialisable image of a machine, handed to participants joining mid-round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub kind: RoundKind,
    /// Time left before the Collect deadline
    pub remaining_ms: u64,
    pub payloads: PayloadStore,
    pub outcome: Option<Outcome>,
    pub participants: ParticipantSet,
    pub counters: RetryCounters,
    pub failed_keepers: BTreeSet<ParticipantId>,
    pub attempts: Vec<SettlementAttempt>,
    pub settle_remaining_ms: Option<u64>,
    pub checkpoint: Option<Checkpoint>,
    pub pending: VecDeque<TaskId>,
    pub unresolved: BTreeSet<TaskId>,
    #[serde(default)]
    pub task_rounds: BTreeMap<TaskId, u32>,
    #[serde(default)]
    pub exhausted: BTreeSet<TaskId>,
    pub abandon_reason: Option<AbandonReason>,
}

/// Per-agent round orchestrator
pub struct RoundStateMachine {
    config: ProtocolConfig,
    local: ParticipantId,
    participants: ParticipantSet,
    evaluator: QuorumEvaluator,
    selector: KeeperSelector,
    round: Round,
    counters: RetryCounters,
    failed_keepers: BTreeSet<ParticipantId>,
    /// Attempts for the active round, oldest first
    attempts: Vec<SettlementAttempt>,
    settle_deadline: Option<Instant>,
    checkpoint: Option<Checkpoint>,
    /// Requested tasks not yet part of a batch, admitted front first
    pending: VecDeque<TaskId>,
    /// Membership index over `pending`
    queued: BTreeSet<TaskId>,
    /// Tasks the last merge left unresolved
    unresolved: BTreeSet<TaskId>,
    /// Agreed rounds each task has stayed unresolved
    task_rounds: BTreeMap<TaskId, u32>,
    /// Unresolved tasks of the active round that used up `max_task_rounds`
    exhausted: BTreeSet<TaskId>,
    early_bundles: Vec<PayloadBundle>,
    early_notices: Vec<SettlementNotice>,
    abandon_reason: Option<AbandonReason>,
    history: Vec<(RoundId, RoundKind)>,
}

impl RoundStateMachine {
    /// Build a machine for `local`, resuming after `checkpoint` if one was persisted
    pub fn new(
        config: ProtocolConfig,
        local: ParticipantId,
        checkpoint: Option<Checkpoint>,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let participants = config.participant_set();
        if !participants.contains(&local) {
            return Err(ConsensusError::UnknownParticipant(local));
        }

        let round_id = checkpoint
            .as_ref()
            .map(|c| c.last_finalized_round_id + 1)
            .unwrap_or(0);
        let round = Round::new(round_id, BTreeSet::new(), now, config.round_timeout());

        tracing::info!(
            "Round machine for {} starting at round {} ({} participants, quorum {})",
            local,
            round_id,
            participants.len(),
            config.quorum.threshold(participants.len())
        );

        Ok(Self {
            evaluator: QuorumEvaluator::new(config.quorum),
            selector: KeeperSelector::new(),
            participants,
            local,
            round,
            counters: RetryCounters::default(),
            failed_keepers: BTreeSet::new(),
            attempts: Vec::new(),
            settle_deadline: None,
            checkpoint,
            pending: VecDeque::new(),
            queued: BTreeSet::new(),
            unresolved: BTreeSet::new(),
            task_rounds: BTreeMap::new(),
            exhausted: BTreeSet::new(),
            early_bundles: Vec::new(),
            early_notices: Vec::new(),
            abandon_reason: None,
            history: vec![(round_id, RoundKind::Collect)],
            config,
        })
    }

    /// Rebuild a machine from a peer's snapshot
    pub fn resume(
        config: ProtocolConfig,
        local: ParticipantId,
        snapshot: RoundSnapshot,
        now: Instant,
    ) -> Result<Self> {
        let mut machine = Self::new(config, local, snapshot.checkpoint.clone(), now)?;
        if snapshot.participants.len() != machine.participants.len()
            || !machine.participants.ids().all(|id| snapshot.participants.contains(id))
        {
            return Err(ConsensusError::InvalidConfig(
                "snapshot participant set differs from configuration".into(),
            ));
        }

        machine.round = Round {
            id: snapshot.round_id,
            kind: snapshot.kind,
            start_time: now,
            deadline: now + Duration::from_millis(snapshot.remaining_ms),
            payloads: snapshot.payloads,
            outcome: snapshot.outcome,
        };
        machine.participants = snapshot.participants;
        machine.counters = snapshot.counters;
        machine.failed_keepers = snapshot.failed_keepers;
        machine.attempts = snapshot.attempts;
        machine.settle_deadline = snapshot
            .settle_remaining_ms
            .map(|ms| now + Duration::from_millis(ms));
        machine.queued = snapshot.pending.iter().cloned().collect();
        machine.pending = snapshot.pending;
        machine.unresolved = snapshot.unresolved;
        machine.task_rounds = snapshot.task_rounds;
        machine.exhausted = snapshot.exhausted;
        machine.abandon_reason = snapshot.abandon_reason;
        machine.history = vec![(snapshot.round_id, snapshot.kind)];

        tracing::info!(
            "Resumed round {} in {} from snapshot ({} payloads)",
            machine.round.id,
            machine.round.kind,
            machine.round.payloads.len()
        );
        Ok(machine)
    }

    pub fn snapshot(&self, now: Instant) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.round.id,
            kind: self.round.kind,
            remaining_ms: self.round.deadline.saturating_duration_since(now).as_millis() as u64,
            payloads: self.round.payloads.clone(),
            outcome: self.round.outcome.clone(),
            participants: self.participants.clone(),
            counters: self.counters,
            failed_keepers: self.failed_keepers.clone(),
            attempts: self.attempts.clone(),
            settle_remaining_ms: self
                .settle_deadline
                .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            checkpoint: self.checkpoint.clone(),
            pending: self.pending.clone(),
            unresolved: self.unresolved.clone(),
            task_rounds: self.task_rounds.clone(),
            exhausted: self.exhausted.clone(),
            abandon_reason: self.abandon_reason.clone(),
        }
    }

    /// Work the local agent still owes the active round
    pub fn start(&self) -> Vec<Action> {
        let batch = self.round.payloads.batch();
        if self.round.kind == RoundKind::Collect
            && !batch.is_empty()
            && !self.round.payloads.has_submitted(&self.local)
        {
            vec![Action::ExecuteTasks {
                round_id: self.round.id,
                tasks: batch.iter().cloned().collect(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Queue newly requested tasks. An idle Collect round takes them at once.
    pub fn on_requests<I: IntoIterator<Item = TaskId>>(&mut self, tasks: I, now: Instant) -> Vec<Action> {
        let batch = self.round.payloads.batch();
        let fresh: Vec<TaskId> = tasks.into_iter().filter(|t| !batch.contains(t)).collect();
        for task in fresh {
            self.enqueue(task);
        }

        let idle = self.round.kind == RoundKind::Collect
            && self.round.payloads.batch().is_empty()
            && self.round.payloads.is_empty();
        if !idle || self.pending.is_empty() {
            return Vec::new();
        }

        let admitted = self.take_pending(self.config.max_tasks_per_round);
        self.round.payloads.admit_tasks(admitted.iter().cloned());
        self.round.start_time = now;
        self.round.deadline = now + self.config.round_timeout();

        tracing::debug!("Round {} admitted {} tasks", self.round.id, admitted.len());
        vec![Action::ExecuteTasks {
            round_id: self.round.id,
            tasks: admitted,
        }]
    }

    /// Apply a bundle delivered by the substrate
    pub fn on_bundle(&mut self, bundle: PayloadBundle, now: Instant) -> Result<Vec<Action>> {
        if !self.participants.contains(&bundle.sender) {
            return Err(ConsensusError::UnknownParticipant(bundle.sender));
        }

        if bundle.round_id > self.round.id {
            self.buffer_early_bundle(bundle);
            return Ok(Vec::new());
        }
        if bundle.round_id < self.round.id {
            return Err(ConsensusError::StalePayload {
                current: self.round.id,
                got: bundle.round_id,
            });
        }
        if self.round.kind != RoundKind::Collect {
            tracing::debug!(
                "Late bundle from {} for round {} ignored in {}",
                bundle.sender,
                bundle.round_id,
                self.round.kind
            );
            return Ok(Vec::new());
        }

        let sender = bundle.sender.clone();
        let receipt = self.round.payloads.submit_bundle(bundle)?;
        for rejected in &receipt.rejected {
            tracing::debug!("Payload from {} refused: {}", sender, rejected);
        }
        tracing::debug!(
            "Round {}: bundle from {} ({} accepted, {}/{} submitted)",
            self.round.id,
            sender,
            receipt.accepted,
            self.round.payloads.submitters().len(),
            self.evaluator.quorum_size(&self.participants)
        );

        if self.evaluator.is_quorum_reached(&self.round.payloads, &self.participants) {
            return Ok(self.agree(now));
        }
        Ok(Vec::new())
    }

    /// The local keeper's submission returned a transaction hash
    pub fn record_submission(&mut self, attempt_number: u32, tx_hash: TxHash) -> Vec<Action> {
        if !self.is_current_attempt(attempt_number) {
            return Vec::new();
        }
        let Some(attempt) = self.attempts.last() else {
            return Vec::new();
        };
        if attempt.keeper != self.local || attempt.submitted_tx_hash.is_some() {
            return Vec::new();
        }
        let Some(outcome_hash) = self.round.outcome.as_ref().map(|o| o.hash()) else {
            return Vec::new();
        };

        let updated = attempt.with_tx_hash(tx_hash.clone());
        self.supersede_attempt(updated);

        let notice = SettlementNotice {
            round_id: self.round.id,
            attempt_number,
            keeper: self.local.clone(),
            outcome_hash,
            tx_hash: tx_hash.clone(),
        };
        tracing::info!(
            "Round {} attempt {}: settlement submitted as {}",
            self.round.id,
            attempt_number,
            tx_hash
        );

        vec![
            Action::AnnounceSettlement(notice),
            Action::TrackSettlement {
                round_id: self.round.id,
                attempt_number,
                tx_hash,
            },
        ]
    }

    /// A keeper announced its submission
    pub fn on_settlement_notice(&mut self, notice: SettlementNotice) -> Result<Vec<Action>> {
        if !self.participants.contains(&notice.keeper) {
            return Err(ConsensusError::UnknownParticipant(notice.keeper));
        }
        if notice.round_id > self.round.id
            || (notice.round_id == self.round.id && notice.attempt_number as usize > self.attempts.len())
        {
            self.buffer_early_notice(notice);
            return Ok(Vec::new());
        }
        self.accept_notice(notice)
    }

    /// Result of tracking an attempt.
    ///
    /// Reports count for the current attempt. A confirmation of an attempt
    /// that already timed out still finalizes the round, since its
    /// transaction is on the target and a resubmission would write twice.
    pub fn on_settlement_status(
        &mut self,
        attempt_number: u32,
        report: SettlementReport,
        now: Instant,
    ) -> Vec<Action> {
        if let SettlementReport::Confirmed { tx_hash } = &report {
            if self.is_superseded_submission(attempt_number, tx_hash) {
                tracing::info!(
                    "Round {}: superseded attempt {} was included as {}",
                    self.round.id,
                    attempt_number,
                    tx_hash
                );
                return self.finalize(Some(tx_hash.clone()), now);
            }
        }
        if !self.is_current_attempt(attempt_number) {
            tracing::debug!(
                "Ignoring settlement report for attempt {} in round {} ({})",
                attempt_number,
                self.round.id,
                self.round.kind
            );
            return Vec::new();
        }

        match report {
            SettlementReport::Confirmed { tx_hash } => self.finalize(Some(tx_hash), now),
            SettlementReport::TimedOut => self.keeper_timed_out(now),
            SettlementReport::Rejected { reason } => {
                if let Some(attempt) = self.attempts.last() {
                    let rejected = attempt.with_status(AttemptStatus::Rejected);
                    self.supersede_attempt(rejected);
                }
                tracing::error!("{}", ConsensusError::SettlementRejected(reason.clone()));
                self.abandon(AbandonReason::SettlementRejected(reason))
            }
        }
    }

    /// Advance on the clock
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        match self.round.kind {
            RoundKind::Collect if now >= self.round.deadline => self.collect_deadline(now),
            RoundKind::Settle => match self.settle_deadline {
                Some(deadline) if now >= deadline => self.keeper_timed_out(now),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Align with the substrate height while nothing has been collected
    pub fn on_height(&mut self, height: u64, now: Instant) -> Vec<Action> {
        if self.round.kind != RoundKind::Collect || height <= self.round.id || !self.round.payloads.is_empty() {
            return Vec::new();
        }

        let batch = self.round.payloads.batch().clone();
        tracing::debug!("Round {} aligned to substrate height {}", self.round.id, height);
        self.round = Round::new(height, batch, now, self.config.round_timeout());
        self.record(RoundKind::Collect);
        self.replay_early(now, self.start())
    }

    /// Leave an abandoned round for a fresh one
    pub fn restart(&mut self, now: Instant) -> Vec<Action> {
        if self.round.kind != RoundKind::Abandoned {
            return Vec::new();
        }

        if let Some(reason) = self.abandon_reason.take() {
            let batch: Vec<TaskId> = self.round.payloads.batch().iter().cloned().collect();
            if reason.requeues_tasks() {
                for task in batch {
                    if !self.exhausted.contains(&task) {
                        self.enqueue(task);
                    }
                }
            } else {
                for task in &batch {
                    self.task_rounds.remove(task);
                }
            }
        }
        self.counters = RetryCounters::default();
        self.begin_round(self.round.id + 1, now)
    }

    pub fn round_id(&self) -> RoundId {
        self.round.id
    }

    pub fn kind(&self) -> RoundKind {
        self.round.kind
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn participants(&self) -> &ParticipantSet {
        &self.participants
    }

    pub fn counters(&self) -> RetryCounters {
        self.counters
    }

    pub fn attempts(&self) -> &[SettlementAttempt] {
        &self.attempts
    }

    pub fn current_keeper(&self) -> Option<&ParticipantId> {
        match self.round.kind {
            RoundKind::Settle => self.attempts.last().map(|a| &a.keeper),
            _ => None,
        }
    }

    pub fn failed_keepers(&self) -> &BTreeSet<ParticipantId> {
        &self.failed_keepers
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    pub fn pending(&self) -> &VecDeque<TaskId> {
        &self.pending
    }

    pub fn unresolved(&self) -> &BTreeSet<TaskId> {
        &self.unresolved
    }

    pub fn abandon_reason(&self) -> Option<&AbandonReason> {
        self.abandon_reason.as_ref()
    }

    /// Phases entered, oldest first
    pub fn history(&self) -> &[(RoundId, RoundKind)] {
        &self.history
    }

    fn agree(&mut self, now: Instant) -> Vec<Action> {
        self.set_kind(RoundKind::Agree);

        for member in self.participants.ids().cloned().collect::<Vec<_>>() {
            let live = self.round.payloads.has_submitted(&member);
            self.participants.set_live(&member, live);
        }

        let merged = self.evaluator.merge(&self.round.payloads, &self.participants);
        self.unresolved = merged.unresolved;
        self.charge_unresolved();

        if merged.outcome.is_empty() {
            self.counters.agreement_retries += 1;
            tracing::warn!(
                "{} ({} tasks, retry {}/{})",
                ConsensusError::UnresolvedOutcome(self.round.id),
                self.unresolved.len(),
                self.counters.agreement_retries,
                self.config.max_attempts
            );
            if self.counters.agreement_retries >= self.config.max_attempts {
                return self.abandon(AbandonReason::AgreementRetriesExhausted);
            }
            self.requeue_unresolved();
            return self.begin_round(self.round.id + 1, now);
        }

        let outcome_hash = merged.outcome.hash();
        tracing::info!(
            "Round {} agreed on {} tasks ({} unresolved, outcome {})",
            self.round.id,
            merged.outcome.merged.len(),
            self.unresolved.len(),
            outcome_hash
        );
        self.round.outcome = Some(merged.outcome);

        let already_settled = self
            .checkpoint
            .as_ref()
            .is_some_and(|c| c.last_outcome_hash == outcome_hash);
        if already_settled {
            tracing::info!(
                "Round {} outcome {} matches the checkpoint, skipping resubmission",
                self.round.id,
                outcome_hash
            );
            return self.finalize(None, now);
        }

        self.select_keeper(now)
    }

    fn select_keeper(&mut self, now: Instant) -> Vec<Action> {
        self.set_kind(RoundKind::SelectKeeper);

        let Some(choice) = self
            .selector
            .select(self.round.id, &self.participants, &self.failed_keepers)
        else {
            return self.abandon(AbandonReason::KeeperRetriesExhausted);
        };
        if choice.cycle_reset {
            tracing::debug!("Round {}: keeper rotation completed a full cycle", self.round.id);
            self.failed_keepers.clear();
        }

        let prior_submissions: Vec<(u32, TxHash)> = self
            .attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::TimedOut)
            .filter_map(|a| a.submitted_tx_hash.clone().map(|tx| (a.attempt_number, tx)))
            .collect();

        let attempt_number = self.attempts.len() as u32 + 1;
        self.attempts
            .push(SettlementAttempt::pending(attempt_number, choice.keeper.clone()));
        self.settle_deadline = Some(now + self.config.keeper_timeout());
        self.set_kind(RoundKind::Settle);

        tracing::info!(
            "Round {} attempt {}: keeper is {}",
            self.round.id,
            attempt_number,
            choice.keeper
        );

        let mut actions = vec![Action::KeeperElected {
            round_id: self.round.id,
            attempt_number,
            keeper: choice.keeper.clone(),
        }];
        // Superseded submissions may still land; keep watching them
        for (prior_attempt, tx_hash) in &prior_submissions {
            actions.push(Action::TrackSettlement {
                round_id: self.round.id,
                attempt_number: *prior_attempt,
                tx_hash: tx_hash.clone(),
            });
        }
        if choice.keeper == self.local {
            if let Some(outcome) = self.round.outcome.clone() {
                actions.push(Action::SubmitSettlement {
                    round_id: self.round.id,
                    attempt_number,
                    outcome,
                    prior_submissions,
                });
            }
        }

        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.early_notices)
            .into_iter()
            .partition(|n| n.round_id == self.round.id && n.attempt_number == attempt_number);
        self.early_notices = later
            .into_iter()
            .filter(|n| n.round_id >= self.round.id)
            .collect();
        for notice in due {
            match self.accept_notice(notice) {
                Ok(more) => actions.extend(more),
                Err(e) => tracing::warn!("{}", e),
            }
        }

        actions
    }

    fn accept_notice(&mut self, notice: SettlementNotice) -> Result<Vec<Action>> {
        let refuse = |reason: &str| ConsensusError::NoticeMismatch {
            round_id: notice.round_id,
            reason: reason.to_string(),
        };

        if notice.round_id != self.round.id || self.round.kind != RoundKind::Settle {
            return Err(refuse("round is not settling"));
        }
        let Some(index) = self
            .attempts
            .iter()
            .position(|a| a.attempt_number == notice.attempt_number)
        else {
            return Err(refuse("no such attempt"));
        };
        let attempt = &self.attempts[index];
        if attempt.keeper != notice.keeper {
            return Err(refuse("sender is not the elected keeper"));
        }
        let local_hash = self.round.outcome.as_ref().map(|o| o.hash());
        if local_hash != Some(notice.outcome_hash) {
            return Err(refuse("outcome hash differs from the local outcome"));
        }
        if attempt.submitted_tx_hash.is_some() {
            return Ok(Vec::new());
        }

        let updated = attempt.with_tx_hash(notice.tx_hash.clone());
        self.supersede_attempt_at(index, updated);

        Ok(vec![Action::TrackSettlement {
            round_id: notice.round_id,
            attempt_number: notice.attempt_number,
            tx_hash: notice.tx_hash,
        }])
    }

    fn keeper_timed_out(&mut self, now: Instant) -> Vec<Action> {
        let Some(attempt) = self.attempts.last().cloned() else {
            return Vec::new();
        };
        self.supersede_attempt(attempt.with_status(AttemptStatus::TimedOut));
        self.settle_deadline = None;
        self.counters.keeper_failures += 1;
        self.failed_keepers.insert(attempt.keeper.clone());

        tracing::warn!(
            "{} in round {} ({}/{} retries)",
            ConsensusError::KeeperTimeout {
                keeper: attempt.keeper,
                attempt_number: attempt.attempt_number,
            },
            self.round.id,
            self.counters.keeper_failures,
            self.config.keeper_allowed_retries
        );

        if self.counters.keeper_failures > self.config.keeper_allowed_retries {
            return self.abandon(AbandonReason::KeeperRetriesExhausted);
        }
        self.select_keeper(now)
    }

    fn collect_deadline(&mut self, now: Instant) -> Vec<Action> {
        // Nothing requested yet: just keep the round open
        if self.round.payloads.batch().is_empty() {
            self.round.deadline = now + self.config.round_timeout();
            return Vec::new();
        }

        self.counters.collect_extensions += 1;
        if self.counters.collect_extensions >= self.config.max_attempts {
            return self.abandon(AbandonReason::CollectAttemptsExhausted);
        }

        tracing::debug!(
            "Round {} collect deadline passed with {} submitters, extending ({}/{})",
            self.round.id,
            self.round.payloads.submitters().len(),
            self.counters.collect_extensions,
            self.config.max_attempts
        );
        self.round.deadline = now + self.config.round_timeout();
        Vec::new()
    }

    fn finalize(&mut self, tx_hash: Option<TxHash>, now: Instant) -> Vec<Action> {
        let Some(outcome) = self.round.outcome.clone() else {
            return Vec::new();
        };
        self.set_kind(RoundKind::Finalize);

        let outcome_hash = outcome.hash();
        let resubmission_skipped = tx_hash.is_none();
        let mut actions = Vec::new();

        if let Some(tx_hash) = tx_hash {
            let index = self
                .attempts
                .iter()
                .position(|a| a.submitted_tx_hash.as_ref() == Some(&tx_hash))
                .or(self.attempts.len().checked_sub(1));
            if let Some(index) = index {
                let confirmed = self.attempts[index].with_status(AttemptStatus::Confirmed);
                self.supersede_attempt_at(index, confirmed);
            }
            let checkpoint = Checkpoint {
                last_finalized_round_id: self.round.id,
                last_outcome_hash: outcome_hash,
                settlement_tx: Some(tx_hash),
            };
            self.checkpoint = Some(checkpoint.clone());
            actions.push(Action::PersistCheckpoint(checkpoint));
        }

        tracing::info!(
            "Round {} finalized: {} tasks settled, outcome {}",
            self.round.id,
            outcome.merged.len(),
            outcome_hash
        );
        actions.push(Action::RoundFinalized {
            round_id: self.round.id,
            outcome_hash,
            resubmission_skipped,
            settled_tasks: outcome.merged.len(),
        });

        for task in outcome.merged.keys() {
            self.task_rounds.remove(task);
        }
        self.counters = RetryCounters::default();
        self.requeue_unresolved();
        actions.extend(self.begin_round(self.round.id + 1, now));
        actions
    }

    fn abandon(&mut self, reason: AbandonReason) -> Vec<Action> {
        self.set_kind(RoundKind::Abandoned);
        self.settle_deadline = None;

        let tasks: Vec<TaskId> = self.round.payloads.batch().iter().cloned().collect();
        tracing::error!(
            "Round {} abandoned: {} ({} tasks, {})",
            self.round.id,
            reason,
            tasks.len(),
            if reason.requeues_tasks() { "requeued" } else { "dropped" }
        );
        self.abandon_reason = Some(reason.clone());

        vec![Action::RoundAbandoned {
            round_id: self.round.id,
            reason,
            tasks,
        }]
    }

    /// Open round `id` in Collect with tasks from the front of the queue
    fn begin_round(&mut self, id: RoundId, now: Instant) -> Vec<Action> {
        let batch: BTreeSet<TaskId> = self
            .take_pending(self.config.max_tasks_per_round)
            .into_iter()
            .collect();

        self.round = Round::new(id, batch, now, self.config.round_timeout());
        self.counters.collect_extensions = 0;
        self.counters.keeper_failures = 0;
        self.failed_keepers.clear();
        self.attempts.clear();
        self.settle_deadline = None;
        self.abandon_reason = None;
        self.exhausted.clear();
        self.record(RoundKind::Collect);

        let start = self.start();
        self.replay_early(now, start)
    }

    fn replay_early(&mut self, now: Instant, mut actions: Vec<Action>) -> Vec<Action> {
        let current = self.round.id;
        self.early_notices.retain(|n| n.round_id >= current);

        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.early_bundles)
            .into_iter()
            .filter(|b| b.round_id >= current)
            .partition(|b| b.round_id == current);
        self.early_bundles = later;

        for bundle in due {
            match self.on_bundle(bundle, now) {
                Ok(more) => actions.extend(more),
                Err(e) => tracing::debug!("Buffered bundle refused: {}", e),
            }
        }
        actions
    }

    fn buffer_early_bundle(&mut self, bundle: PayloadBundle) {
        let limit = self.participants.len() * EARLY_BUNDLES_PER_PARTICIPANT;
        if self.early_bundles.len() >= limit {
            self.early_bundles.remove(0);
        }
        tracing::debug!(
            "Buffering bundle from {} for future round {}",
            bundle.sender,
            bundle.round_id
        );
        self.early_bundles.push(bundle);
    }

    fn buffer_early_notice(&mut self, notice: SettlementNotice) {
        let limit = self.participants.len() * EARLY_NOTICES_PER_PARTICIPANT;
        if self.early_notices.len() >= limit {
            self.early_notices.remove(0);
        }
        tracing::debug!(
            "Buffering notice from {} for round {} attempt {}",
            notice.keeper,
            notice.round_id,
            notice.attempt_number
        );
        self.early_notices.push(notice);
    }

    fn enqueue(&mut self, task: TaskId) {
        if self.queued.insert(task.clone()) {
            self.pending.push_back(task);
        }
    }

    fn take_pending(&mut self, limit: usize) -> Vec<TaskId> {
        let count = limit.min(self.pending.len());
        let taken: Vec<TaskId> = self.pending.drain(..count).collect();
        for task in &taken {
            self.queued.remove(task);
        }
        taken
    }

    /// Count another agreed round against each unresolved task
    fn charge_unresolved(&mut self) {
        for task in &self.unresolved {
            let rounds = self.task_rounds.entry(task.clone()).or_insert(0);
            *rounds += 1;
            if *rounds >= self.config.max_task_rounds {
                tracing::warn!(
                    "Round {}: task {} dropped after {} unresolved rounds",
                    self.round.id,
                    task,
                    rounds
                );
                self.exhausted.insert(task.clone());
            }
        }
        for task in &self.exhausted {
            self.task_rounds.remove(task);
        }
    }

    /// Unresolved tasks with rounds left go to the back of the queue
    fn requeue_unresolved(&mut self) {
        for task in std::mem::take(&mut self.unresolved) {
            if !self.exhausted.contains(&task) {
                self.enqueue(task);
            }
        }
    }

    /// `attempt_number` timed out after submitting `tx_hash` in the settling round
    fn is_superseded_submission(&self, attempt_number: u32, tx_hash: &TxHash) -> bool {
        self.round.kind == RoundKind::Settle
            && self.attempts.iter().any(|a| {
                a.attempt_number == attempt_number
                    && a.status == AttemptStatus::TimedOut
                    && a.submitted_tx_hash.as_ref() == Some(tx_hash)
            })
    }

    fn is_current_attempt(&self, attempt_number: u32) -> bool {
        self.round.kind == RoundKind::Settle
            && self
                .attempts
                .last()
                .is_some_and(|a| a.attempt_number == attempt_number && a.status == AttemptStatus::Pending)
    }

    /// Attempts are replaced, never edited in place
    fn supersede_attempt(&mut self, attempt: SettlementAttempt) {
        if let Some(last) = self.attempts.len().checked_sub(1) {
            self.supersede_attempt_at(last, attempt);
        }
    }

    fn supersede_attempt_at(&mut self, index: usize, attempt: SettlementAttempt) {
        if let Some(slot) = self.attempts.get_mut(index) {
            *slot = attempt;
        }
    }

    fn set_kind(&mut self, kind: RoundKind) {
        self.round.kind = kind;
        self.record(kind);
    }

    fn record(&mut self, kind: RoundKind) {
        if self.history.len() >= HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push((self.round.id, kind));
    }
}
