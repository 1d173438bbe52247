//! Replication substrate
//!
//! The substrate orders every protocol message and delivers it to every
//! agent, the sender included, in the same order. Each delivery carries a
//! monotonic height: the highest round id the substrate has ordered so far.

use async_trait::async_trait;
use mech_consensus::{ProtocolMessage, RoundId};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Default capacity of the in-process bus
pub const BUS_CAPACITY: usize = 4096;

/// An encoded message as ordered by the substrate
#[derive(Debug, Clone)]
struct Frame {
    sequence: u64,
    height: u64,
    bytes: Vec<u8>,
}

/// A message delivered to an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Position in the total order
    pub sequence: u64,
    pub height: u64,
    pub message: ProtocolMessage,
}

/// Subscription to the ordered message stream
pub struct DeliveryReceiver {
    receiver: broadcast::Receiver<Frame>,
}

impl DeliveryReceiver {
    /// Next delivery, or None once the substrate is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => match ProtocolMessage::from_bytes(&frame.bytes) {
                    Ok(message) => {
                        return Some(Delivery {
                            sequence: frame.sequence,
                            height: frame.height,
                            message,
                        })
                    }
                    Err(e) => tracing::warn!("Dropping undecodable frame {}: {}", frame.sequence, e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Delivery receiver lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast side of the substrate
#[async_trait]
pub trait Replication: Send + Sync {
    async fn broadcast(&self, message: ProtocolMessage) -> anyhow::Result<()>;

    fn subscribe(&self) -> DeliveryReceiver;
}

struct BusState {
    sequence: u64,
    height: u64,
}

/// In-process substrate for agents sharing one process
pub struct LocalBus {
    sender: broadcast::Sender<Frame>,
    state: Mutex<BusState>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            state: Mutex::new(BusState { sequence: 0, height: 0 }),
        }
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn round_of(message: &ProtocolMessage) -> Option<RoundId> {
    match message {
        ProtocolMessage::Requests(_) => None,
        ProtocolMessage::Payloads(bundle) => Some(bundle.round_id),
        ProtocolMessage::SettlementSubmitted(notice) => Some(notice.round_id),
    }
}

#[async_trait]
impl Replication for LocalBus {
    async fn broadcast(&self, message: ProtocolMessage) -> anyhow::Result<()> {
        let bytes = message.to_bytes();

        // Sequencing and sending under one lock keeps the order total
        let mut state = self.state.lock();
        state.sequence += 1;
        if let Some(round_id) = round_of(&message) {
            state.height = state.height.max(round_id);
        }
        let frame = Frame {
            sequence: state.sequence,
            height: state.height,
            bytes,
        };

        // No subscribers is not an error
        let _ = self.sender.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> DeliveryReceiver {
        DeliveryReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_consensus::{ParticipantId, PayloadBundle, TaskId};

    #[tokio::test]
    async fn test_all_subscribers_see_the_same_order() {
        let bus = LocalBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.broadcast(ProtocolMessage::Requests(vec![TaskId::from("t1")]))
            .await
            .unwrap();
        bus.broadcast(ProtocolMessage::Payloads(PayloadBundle::new(3, ParticipantId::from("agent-1"))))
            .await
            .unwrap();
        bus.broadcast(ProtocolMessage::Payloads(PayloadBundle::new(2, ParticipantId::from("agent-2"))))
            .await
            .unwrap();

        for receiver in [&mut a, &mut b] {
            let first = receiver.recv().await.unwrap();
            let second = receiver.recv().await.unwrap();
            let third = receiver.recv().await.unwrap();
            assert_eq!((first.sequence, first.height), (1, 0));
            assert_eq!((second.sequence, second.height), (2, 3));
            // Height never goes backwards
            assert_eq!((third.sequence, third.height), (3, 3));
            assert!(matches!(first.message, ProtocolMessage::Requests(_)));
        }
        assert_eq!(bus.height(), 3);
    }

    #[tokio::test]
    async fn test_closed_bus_ends_stream() {
        let bus = LocalBus::new(8);
        let mut receiver = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(bus);
        assert!(receiver.recv().await.is_none());
    }
}
