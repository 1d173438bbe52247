//! Multi-agent runs over the in-process bus and ledger

use crate::persistence::{CheckpointStore, MemoryCheckpointStore};
use crate::provider::HashingProvider;
use crate::replication::LocalBus;
use crate::status::SharedStatus;
use crate::task_runner::{TaskRunnerConfig, TaskSender};
use crate::AgentBuilder;
use keeper_settlement::InMemoryLedger;
use mech_consensus::{Checkpoint, OutcomeHash, ParticipantId, ProtocolConfig, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const GROUP: [&str; 4] = ["agent-0", "agent-1", "agent-2", "agent-3"];

fn fast_config() -> ProtocolConfig {
    let mut config = ProtocolConfig::for_participants(&GROUP);
    config.round_timeout_ms = 5_000;
    config.keeper_timeout_ms = 400;
    config.settlement_poll_interval_ms = 10;
    config
}

fn fast_runner() -> TaskRunnerConfig {
    TaskRunnerConfig {
        task_deadline_ms: 1_000,
        ..Default::default()
    }
}

struct Group {
    senders: Vec<TaskSender>,
    statuses: Vec<SharedStatus>,
    stores: Vec<Arc<MemoryCheckpointStore>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Group {
    fn spawn(ledger: Arc<InMemoryLedger>) -> Self {
        let bus = Arc::new(LocalBus::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut group = Group {
            senders: Vec::new(),
            statuses: Vec::new(),
            stores: Vec::new(),
            shutdown,
            handles: Vec::new(),
        };

        for id in GROUP {
            let store = Arc::new(MemoryCheckpointStore::new());
            let agent = AgentBuilder::new(fast_config(), ParticipantId::from(id))
                .runner_config(fast_runner())
                .provider(Arc::new(HashingProvider::new("group")))
                .settlement_target(ledger.clone())
                .replication(bus.clone())
                .checkpoints(store.clone())
                .tick_interval(Duration::from_millis(10))
                .build()
                .unwrap();

            group.senders.push(agent.task_sender());
            group.statuses.push(agent.status());
            group.stores.push(store);

            let mut rx = shutdown_rx.clone();
            group.handles.push(tokio::spawn(agent.run_until(async move {
                let _ = rx.changed().await;
            })));
        }
        group
    }

    fn request(&self, tasks: &[&str]) {
        for task in tasks {
            self.senders[0].send(TaskId::from(*task)).unwrap();
        }
    }

    async fn wait_for_finalized(&self, rounds: u64) -> bool {
        for _ in 0..500 {
            if self.statuses.iter().all(|s| s.read().finalized_rounds >= rounds) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            handle.await.unwrap().unwrap();
        }
    }
}

fn checkpoint_hashes(stores: &[Arc<MemoryCheckpointStore>]) -> Vec<OutcomeHash> {
    stores
        .iter()
        .map(|s| s.load().unwrap().unwrap().last_outcome_hash)
        .collect()
}

#[tokio::test]
async fn test_group_settles_round_exactly_once() {
    let ledger = Arc::new(InMemoryLedger::new());
    let group = Group::spawn(ledger.clone());

    group.request(&["t1", "t2", "t3"]);
    assert!(group.wait_for_finalized(1).await);

    let writes = ledger.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].round_id, 0);
    assert_eq!(ledger.write_count(&writes[0].outcome_hash), 1);

    // Every agent checkpointed the settled outcome
    for hash in checkpoint_hashes(&group.stores) {
        assert_eq!(hash, writes[0].outcome_hash);
    }
    for status in &group.statuses {
        let status = status.read();
        assert_eq!(status.abandoned_rounds, 0);
        assert_eq!(status.last_checkpoint.as_ref().map(|c| c.round_id), Some(0));
    }

    group.stop().await;
}

#[tokio::test]
async fn test_group_runs_consecutive_rounds() {
    let ledger = Arc::new(InMemoryLedger::new());
    let group = Group::spawn(ledger.clone());

    group.request(&["t1", "t2"]);
    assert!(group.wait_for_finalized(1).await);
    group.request(&["t3"]);
    assert!(group.wait_for_finalized(2).await);

    let writes = ledger.writes();
    assert_eq!(writes.len(), 2);
    assert_ne!(writes[0].outcome_hash, writes[1].outcome_hash);
    for write in &writes {
        assert_eq!(ledger.write_count(&write.outcome_hash), 1);
    }
    for hash in checkpoint_hashes(&group.stores) {
        assert_eq!(hash, writes[1].outcome_hash);
    }

    group.stop().await;
}

#[tokio::test]
async fn test_dropped_keeper_is_rotated_out() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.drop_submissions_from(ParticipantId::from("agent-0"));
    let group = Group::spawn(ledger.clone());

    group.request(&["t1", "t2"]);
    assert!(group.wait_for_finalized(1).await);

    let writes = ledger.writes();
    assert_eq!(writes.len(), 1);
    assert_ne!(writes[0].keeper, ParticipantId::from("agent-0"));
    assert_eq!(ledger.write_count(&writes[0].outcome_hash), 1);

    group.stop().await;
}

#[tokio::test]
async fn test_agent_resumes_after_checkpoint() {
    let bus = Arc::new(LocalBus::default());
    let checkpoint = Checkpoint {
        last_finalized_round_id: 6,
        last_outcome_hash: OutcomeHash([7u8; 32]),
        settlement_tx: None,
    };

    let agent = AgentBuilder::new(fast_config(), ParticipantId::from("agent-2"))
        .provider(Arc::new(HashingProvider::new("group")))
        .settlement_target(Arc::new(InMemoryLedger::new()))
        .replication(bus)
        .checkpoints(Arc::new(MemoryCheckpointStore::with_checkpoint(checkpoint.clone())))
        .build()
        .unwrap();

    assert_eq!(agent.machine().round_id(), 7);
    assert_eq!(agent.machine().checkpoint(), Some(&checkpoint));
    assert_eq!(agent.status().read().round_id, 7);
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let result = AgentBuilder::new(fast_config(), ParticipantId::from("agent-0"))
        .provider(Arc::new(HashingProvider::new("group")))
        .build();
    assert!(result.is_err());

    let outsider = AgentBuilder::new(fast_config(), ParticipantId::from("agent-9"))
        .provider(Arc::new(HashingProvider::new("group")))
        .settlement_target(Arc::new(InMemoryLedger::new()))
        .replication(Arc::new(LocalBus::default()))
        .build();
    assert!(outsider.is_err());
}
