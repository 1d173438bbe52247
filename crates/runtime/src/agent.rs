//! Agent - per-process event loop
//!
//! Feeds substrate deliveries, clock ticks and completed background work
//! into the RoundStateMachine and carries out the actions it returns.
//! Provider calls and settlement IO run as spawned tasks that report back
//! through an event channel, so the loop itself never blocks on them.

use crate::persistence::{CheckpointStore, MemoryCheckpointStore};
use crate::provider::TaskResultProvider;
use crate::replication::{Delivery, DeliveryReceiver, Replication};
use crate::status::{AgentStatus, SharedStatus};
use crate::task_runner::{request_queue, RunReport, TaskReceiver, TaskRunner, TaskRunnerConfig, TaskSender};
use crate::{REQUEST_QUEUE_CAPACITY, TICK_INTERVAL_MS};
use keeper_settlement::{SettlementDriver, SettlementError, SettlementTarget};
use mech_consensus::{
    Action, ParticipantId, ProtocolConfig, ProtocolMessage, RoundId, RoundStateMachine, SettlementReport, TxHash,
};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Completed background work
enum AgentEvent {
    TasksExecuted(RunReport),
    Submitted {
        round_id: RoundId,
        attempt_number: u32,
        result: Result<TxHash, SettlementError>,
    },
    Inclusion {
        round_id: RoundId,
        attempt_number: u32,
        report: SettlementReport,
    },
}

pub struct Agent {
    local: ParticipantId,
    machine: RoundStateMachine,
    runner: Arc<TaskRunner>,
    driver: SettlementDriver<dyn SettlementTarget>,
    replication: Arc<dyn Replication>,
    checkpoints: Arc<dyn CheckpointStore>,
    deliveries: Option<DeliveryReceiver>,
    requests: TaskReceiver,
    task_sender: TaskSender,
    status: SharedStatus,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<AgentEvent>>,
    tick_interval: Duration,
    /// Requests forwarded to the substrate per tick
    request_batch: usize,
}

impl Agent {
    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Handle for queueing task requests
    pub fn task_sender(&self) -> TaskSender {
        self.task_sender.clone()
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn machine(&self) -> &RoundStateMachine {
        &self.machine
    }

    /// Run until `shutdown` resolves or the substrate goes away
    pub async fn run_until<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut events = self
            .events_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent {} is already running", self.local))?;
        let mut deliveries = self
            .deliveries
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent {} has no substrate subscription", self.local))?;

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(
            "Agent {} running from round {} ({}ms ticks)",
            self.local,
            self.machine.round_id(),
            self.tick_interval.as_millis()
        );

        let initial = self.machine.start();
        self.execute(initial).await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.on_delivery(delivery).await,
                    None => {
                        tracing::warn!("Agent {}: substrate closed", self.local);
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event).await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        tracing::info!("Agent {} stopped at round {}", self.local, self.machine.round_id());
        Ok(())
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        let now = Instant::now();
        self.status.write().substrate_height = delivery.height;

        let mut actions = self.machine.on_height(delivery.height, now);
        let applied = match delivery.message {
            ProtocolMessage::Requests(tasks) => Ok(self.machine.on_requests(tasks, now)),
            ProtocolMessage::Payloads(bundle) => self.machine.on_bundle(bundle, now),
            ProtocolMessage::SettlementSubmitted(notice) => self.machine.on_settlement_notice(notice),
        };

        match applied {
            Ok(more) => actions.extend(more),
            Err(e) if e.is_local() => tracing::debug!("Agent {}: {}", self.local, e),
            Err(e) => tracing::warn!("Agent {}: {}", self.local, e),
        }
        self.execute(actions).await;
    }

    async fn on_event(&mut self, event: AgentEvent) {
        let now = Instant::now();
        let actions = match event {
            AgentEvent::TasksExecuted(report) => {
                self.tasks_executed(report).await;
                Vec::new()
            }
            AgentEvent::Submitted {
                round_id,
                attempt_number,
                result,
            } => {
                if round_id != self.machine.round_id() {
                    return;
                }
                match result {
                    Ok(tx_hash) => self.machine.record_submission(attempt_number, tx_hash),
                    Err(e) if !e.is_retryable() => self.machine.on_settlement_status(
                        attempt_number,
                        SettlementReport::Rejected { reason: e.to_string() },
                        now,
                    ),
                    Err(e) => {
                        // The keeper timeout rotates us out
                        tracing::warn!("Agent {}: settlement submission failed: {}", self.local, e);
                        Vec::new()
                    }
                }
            }
            AgentEvent::Inclusion {
                round_id,
                attempt_number,
                report,
            } => {
                if round_id != self.machine.round_id() {
                    return;
                }
                self.machine.on_settlement_status(attempt_number, report, now)
            }
        };
        self.execute(actions).await;
    }

    async fn on_tick(&mut self) {
        let requested = self.requests.drain(self.request_batch);
        if !requested.is_empty() {
            tracing::debug!("Agent {} forwarding {} task requests", self.local, requested.len());
            self.broadcast(ProtocolMessage::Requests(requested)).await;
        }

        let actions = self.machine.on_tick(Instant::now());
        self.execute(actions).await;
    }

    async fn tasks_executed(&mut self, report: RunReport) {
        {
            let mut status = self.status.write();
            status.provider_failures += report.failures.len() as u64;
            if let Some(last) = report.bundle.payloads.last() {
                status.record_executed(&last.task_id);
            }
        }

        if report.bundle.round_id != self.machine.round_id() {
            tracing::debug!(
                "Agent {}: results for round {} arrived after the round moved on",
                self.local,
                report.bundle.round_id
            );
            return;
        }
        self.broadcast(ProtocolMessage::Payloads(report.bundle)).await;
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::ExecuteTasks { round_id, tasks } => {
                    let runner = self.runner.clone();
                    let events = self.events_tx.clone();
                    let local = self.local.clone();
                    tokio::spawn(async move {
                        let report = runner.run(round_id, local, tasks).await;
                        let _ = events.send(AgentEvent::TasksExecuted(report));
                    });
                }
                Action::KeeperElected {
                    round_id,
                    attempt_number,
                    keeper,
                } => {
                    if keeper == self.local {
                        tracing::info!(
                            "Agent {} is keeper for round {} attempt {}",
                            self.local,
                            round_id,
                            attempt_number
                        );
                    }
                }
                Action::SubmitSettlement {
                    round_id,
                    attempt_number,
                    outcome,
                    prior_submissions,
                } => {
                    let driver = self.driver.clone();
                    let events = self.events_tx.clone();
                    let keeper = self.local.clone();
                    tokio::spawn(async move {
                        // A superseded keeper's transaction may have landed meanwhile
                        if let Some((prior, tx_hash)) = driver.find_confirmed(&prior_submissions).await {
                            tracing::info!(
                                "Round {}: attempt {} already included as {}, not resubmitting",
                                round_id,
                                prior,
                                tx_hash
                            );
                            let _ = events.send(AgentEvent::Inclusion {
                                round_id,
                                attempt_number: prior,
                                report: SettlementReport::Confirmed { tx_hash },
                            });
                            return;
                        }
                        let result = driver.submit(round_id, attempt_number, keeper, &outcome).await;
                        let _ = events.send(AgentEvent::Submitted {
                            round_id,
                            attempt_number,
                            result,
                        });
                    });
                }
                Action::AnnounceSettlement(notice) => {
                    self.broadcast(ProtocolMessage::SettlementSubmitted(notice)).await;
                }
                Action::TrackSettlement {
                    round_id,
                    attempt_number,
                    tx_hash,
                } => {
                    let driver = self.driver.clone();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        let report = driver.await_inclusion(&tx_hash, driver.keeper_timeout()).await;
                        let _ = events.send(AgentEvent::Inclusion {
                            round_id,
                            attempt_number,
                            report,
                        });
                    });
                }
                Action::PersistCheckpoint(checkpoint) => {
                    if let Err(e) = self.checkpoints.save(&checkpoint) {
                        tracing::error!(
                            "Agent {}: failed to persist checkpoint for round {}: {}",
                            self.local,
                            checkpoint.last_finalized_round_id,
                            e
                        );
                    }
                }
                Action::RoundFinalized {
                    resubmission_skipped, ..
                } => {
                    let mut status = self.status.write();
                    status.finalized_rounds += 1;
                    status.last_finalized_at = Some(chrono::Utc::now().timestamp());
                    if resubmission_skipped {
                        status.skipped_resubmissions += 1;
                    }
                }
                Action::RoundAbandoned { round_id, reason, .. } => {
                    self.status.write().abandoned_rounds += 1;
                    tracing::error!("Agent {}: round {} abandoned ({})", self.local, round_id, reason);
                    queue.extend(self.machine.restart(Instant::now()));
                }
            }
        }

        self.status.write().observe(&self.machine);
    }

    async fn broadcast(&self, message: ProtocolMessage) {
        if let Err(e) = self.replication.broadcast(message).await {
            tracing::error!("Agent {}: broadcast failed: {}", self.local, e);
        }
    }
}

/// Builder for Agent
pub struct AgentBuilder {
    config: ProtocolConfig,
    local: ParticipantId,
    runner_config: TaskRunnerConfig,
    provider: Option<Arc<dyn TaskResultProvider>>,
    target: Option<Arc<dyn SettlementTarget>>,
    replication: Option<Arc<dyn Replication>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    tick_interval: Duration,
}

impl AgentBuilder {
    pub fn new(config: ProtocolConfig, local: ParticipantId) -> Self {
        Self {
            config,
            local,
            runner_config: TaskRunnerConfig::default(),
            provider: None,
            target: None,
            replication: None,
            checkpoints: None,
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
        }
    }

    pub fn runner_config(mut self, config: TaskRunnerConfig) -> Self {
        self.runner_config = config;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn TaskResultProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn settlement_target(mut self, target: Arc<dyn SettlementTarget>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn replication(mut self, replication: Arc<dyn Replication>) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn build(self) -> anyhow::Result<Agent> {
        self.runner_config.validate()?;
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("agent needs a task result provider"))?;
        let target = self
            .target
            .ok_or_else(|| anyhow::anyhow!("agent needs a settlement target"))?;
        let replication = self
            .replication
            .ok_or_else(|| anyhow::anyhow!("agent needs a replication substrate"))?;
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));

        let checkpoint = checkpoints.load()?;
        if let Some(cp) = &checkpoint {
            tracing::info!(
                "Agent {} resuming after finalized round {} (outcome {})",
                self.local,
                cp.last_finalized_round_id,
                cp.last_outcome_hash
            );
        }

        let driver = SettlementDriver::new(
            target,
            self.config.keeper_timeout(),
            self.config.settlement_poll_interval(),
        );
        let request_batch = self.config.max_tasks_per_round;
        let machine = RoundStateMachine::new(self.config, self.local.clone(), checkpoint, Instant::now())?;

        let (task_sender, requests) = request_queue(REQUEST_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(AgentStatus::new(&self.local)));
        status.write().observe(&machine);

        Ok(Agent {
            runner: Arc::new(TaskRunner::new(self.runner_config, provider)),
            deliveries: Some(replication.subscribe()),
            local: self.local,
            machine,
            driver,
            replication,
            checkpoints,
            requests,
            task_sender,
            status,
            events_tx,
            events_rx: Some(events_rx),
            tick_interval: self.tick_interval,
            request_batch,
        })
    }
}
