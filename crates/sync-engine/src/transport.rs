/// Transport seam between an actor's queue and the coordinator
use rand::Rng;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    ActorId, CatchUp, EntityId, MutationRecord, SubmitResponse, Subscription, SyncCoordinator,
    SyncMessage, VectorClock,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is offline")]
    Offline,

    #[error("delivery failed: {0}")]
    Failure(String),

    #[error("coordinator error: {0}")]
    Remote(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl TransportError {
    pub fn is_offline(&self) -> bool {
        matches!(self, TransportError::Offline)
    }
}

/// Where a queue drains to. Delivery is at-least-once: a lost ack means the
/// record is sent again and the coordinator acks it as stale.
pub trait MutationSink {
    fn send(
        &self,
        record: MutationRecord,
    ) -> impl Future<Output = Result<SubmitResponse, TransportError>> + Send;
}

/// Full duplex link used by an actor runtime
pub trait Transport: MutationSink + Clone + Send + Sync + 'static {
    /// Resolved records from other actors
    fn subscribe(&self, actor_id: ActorId) -> Subscription;

    fn unsubscribe(&self, actor_id: &ActorId);

    fn catch_up(
        &self,
        known: BTreeMap<EntityId, VectorClock>,
    ) -> impl Future<Output = Result<CatchUp, TransportError>> + Send;

    fn is_online(&self) -> bool;

    fn set_online(&self, online: bool);
}

impl MutationSink for SyncCoordinator {
    async fn send(&self, record: MutationRecord) -> Result<SubmitResponse, TransportError> {
        self.submit(record)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}

/// In-process link to a coordinator. Every message goes through the JSON
/// codec, connectivity can be toggled and delivery can be delayed at random.
#[derive(Clone)]
pub struct LocalTransport {
    coordinator: Arc<SyncCoordinator>,
    online: Arc<AtomicBool>,
    jitter: Option<Duration>,
}

impl LocalTransport {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            online: Arc::new(AtomicBool::new(true)),
            jitter: None,
        }
    }

    /// Delay each request by up to `max`
    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.jitter = Some(max);
        self
    }

    pub fn offline(self) -> Self {
        self.online.store(false, Ordering::SeqCst);
        self
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Offline)
        }
    }

    async fn delay(&self) {
        let Some(max) = self.jitter else {
            return;
        };
        let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    async fn request(&self, message: SyncMessage) -> Result<SyncMessage, TransportError> {
        self.ensure_online()?;
        self.delay().await;

        let request = relay(&message)?;
        let reply = self.coordinator.handle_message(request).await;

        // Connection dropped while waiting: the reply is lost even if the
        // coordinator applied the request.
        self.ensure_online()?;

        match relay(&reply)? {
            SyncMessage::Error { message } => Err(TransportError::Remote(message)),
            reply => Ok(reply),
        }
    }
}

impl MutationSink for LocalTransport {
    async fn send(&self, record: MutationRecord) -> Result<SubmitResponse, TransportError> {
        match self.request(SyncMessage::Submit { record }).await? {
            SyncMessage::Ack { ack } => Ok(SubmitResponse::Ack(ack)),
            SyncMessage::Reject { reject } => Ok(SubmitResponse::Reject(reject)),
            other => Err(TransportError::UnexpectedReply(other.kind().to_string())),
        }
    }
}

impl Transport for LocalTransport {
    fn subscribe(&self, actor_id: ActorId) -> Subscription {
        let mut upstream = self.coordinator.subscribe(actor_id.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let online = Arc::clone(&self.online);
        let subscriber = actor_id.clone();

        tokio::spawn(async move {
            while let Some(record) = upstream.recv().await {
                if !online.load(Ordering::SeqCst) {
                    debug!(actor = %subscriber, mutation = %record.id, "dropped push while offline");
                    continue;
                }

                match relay(&SyncMessage::Resolved { record }) {
                    Ok(SyncMessage::Resolved { record }) => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Ok(other) => warn!(kind = other.kind(), "unexpected push"),
                    Err(err) => warn!(error = %err, "failed to relay push"),
                }
            }
        });

        Subscription::from_channel(actor_id, rx)
    }

    fn unsubscribe(&self, actor_id: &ActorId) {
        self.coordinator.unsubscribe(actor_id);
    }

    async fn catch_up(
        &self,
        known: BTreeMap<EntityId, VectorClock>,
    ) -> Result<CatchUp, TransportError> {
        match self.request(SyncMessage::SyncRequest { known }).await? {
            SyncMessage::SyncResponse {
                snapshots,
                server_clock,
            } => Ok(CatchUp {
                snapshots,
                server_clock,
            }),
            other => Err(TransportError::UnexpectedReply(other.kind().to_string())),
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

/// Encode and decode one message, as a wire hop would
fn relay(message: &SyncMessage) -> Result<SyncMessage, TransportError> {
    let encoded = message
        .encode()
        .map_err(|e| TransportError::Failure(e.to_string()))?;
    SyncMessage::decode(&encoded).map_err(|e| TransportError::Failure(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorProfile, EntityKind, LocalEdit, SyncConfig};

    fn setup() -> (Arc<SyncCoordinator>, LocalTransport) {
        let coordinator = Arc::new(SyncCoordinator::in_memory(&SyncConfig::default()));
        coordinator.register_actor(ActorProfile::worker("W"));
        coordinator.register_actor(ActorProfile::admin("A"));
        let transport = LocalTransport::new(Arc::clone(&coordinator));
        (coordinator, transport)
    }

    fn record() -> MutationRecord {
        MutationRecord::new(
            ActorId::from("W"),
            1,
            VectorClock::of(&[("W", 1)]),
            LocalEdit::upsert("task-1", EntityKind::Task).set("status", "done"),
        )
    }

    #[tokio::test]
    async fn test_send_round_trips_through_codec() {
        let (coordinator, transport) = setup();

        let response = transport.send(record()).await.unwrap();
        assert!(response.is_ack());
        assert_eq!(coordinator.entities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_send_fails_without_side_effects() {
        let (coordinator, transport) = setup();
        transport.set_online(false);

        assert_eq!(transport.send(record()).await, Err(TransportError::Offline));
        assert!(coordinator.entities().await.unwrap().is_empty());

        transport.set_online(true);
        assert!(transport.send(record()).await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_connectivity() {
        let (_, transport) = setup();
        let other = transport.clone().offline();
        assert!(!transport.is_online());
        assert!(!other.is_online());
    }

    #[tokio::test]
    async fn test_subscription_relays_pushes() {
        let (_, worker) = setup();
        let admin = worker.clone();
        let mut pushes = admin.subscribe(ActorId::from("A"));

        worker.send(record()).await.unwrap();

        let pushed = tokio::time::timeout(Duration::from_secs(1), pushes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.actor_id, ActorId::from("W"));
    }

    #[tokio::test]
    async fn test_jitter_still_delivers() {
        let (_, transport) = setup();
        let transport = transport.with_jitter(Duration::from_millis(5));

        let catch_up = transport.catch_up(BTreeMap::new()).await.unwrap();
        assert!(catch_up.snapshots.is_empty());
        assert!(transport.send(record()).await.unwrap().is_ack());
    }
}
