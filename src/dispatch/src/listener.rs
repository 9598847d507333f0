//! Broker consumer: decodes deliveries, resolves them against the
//! Registry, and feeds either the ETA scheduler or the Ready Queue.

use crate::ready_queue::ReadyItem;
use foreman_broker::Broker;
use foreman_events::{Event, EventDispatcher};
use foreman_pool::EtaScheduler;
use foreman_registry::{DeliveryInfo, Registry, Serializer, TaskId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{info, warn, Instrument};

/// Consumes one queue, decodes and validates deliveries, and routes them
/// onward. Owns in-flight ack tags until the pool reports completion (when
/// `acks_late` holds).
pub struct Listener {
    broker: Arc<dyn Broker>,
    registry: Registry,
    codec: Serializer,
    acks_late: bool,
    events: Arc<EventDispatcher>,
    in_flight: Mutex<HashMap<TaskId, DeliveryInfo>>,
}

impl Listener {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Registry,
        codec: Serializer,
        acks_late: bool,
        events: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            registry,
            codec,
            acks_late,
            events,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Start consuming `queue` with `prefetch` unacknowledged deliveries
    /// outstanding, pushing admitted tasks onto `ready_tx` or, for
    /// future-ETA messages, into `eta_scheduler`.
    pub fn run(
        self: Arc<Self>,
        queue: String,
        prefetch: usize,
        ready_tx: mpsc::Sender<ReadyItem>,
        eta_scheduler: Arc<EtaScheduler>,
    ) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!("listener", queue = %queue, prefetch);
        tokio::spawn(Instrument::instrument(async move {
            let mut deliveries = match self.broker.consume(&queue, prefetch).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "failed to start consuming queue");
                    return;
                }
            };

            while let Some(delivery) = deliveries.recv().await {
                let delivery_info = DeliveryInfo {
                    ack_tag: delivery.ack_tag,
                    redelivered: delivery.redelivered,
                    queue: delivery.queue.clone(),
                };

                let mut message = match self.codec.decode(&delivery.body) {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(error = %err, "malformed message, rejecting");
                        let _ = self.broker.reject(delivery.ack_tag, false).await;
                        continue;
                    }
                };

                if !self.registry.contains(&message.name) {
                    warn!(task_name = %message.name, "unknown task, rejecting");
                    let _ = self.broker.reject(delivery.ack_tag, false).await;
                    continue;
                }

                let now = SystemTime::now();
                if message.is_expired(now) {
                    warn!(task_id = %message.id, task_name = %message.name, "task expired, rejecting");
                    let _ = self.broker.reject(delivery.ack_tag, false).await;
                    continue;
                }

                let entry = self.registry.get(&message.name).expect("checked contains above");
                message.delivery = Some(delivery_info.clone());

                if self.acks_late {
                    self.in_flight.lock().insert(message.id, delivery_info);
                } else {
                    let _ = self.broker.ack(delivery.ack_tag).await;
                }

                self.events
                    .emit(Event::TaskReceived { task_id: message.id, task_name: message.name.clone() })
                    .await;

                if message.is_due(now) {
                    info!(task_id = %message.id, task_name = %message.name, "task ready");
                    if ready_tx.send(ReadyItem { message, entry }).await.is_err() {
                        break;
                    }
                } else {
                    let eta = message.eta.expect("is_due is false implies an eta");
                    info!(task_id = %message.id, task_name = %message.name, "task scheduled");
                    eta_scheduler.enter(message, eta);
                }
            }
        }, span))
    }

    /// Called once the pool (via the Mediator) has a terminal outcome for
    /// a task that was consumed with `acks_late`. No-op for tasks that
    /// were already acked at dispatch time.
    pub async fn complete(&self, task_id: TaskId, success: bool) {
        let delivery = self.in_flight.lock().remove(&task_id);
        if let Some(info) = delivery {
            let result = if success {
                self.broker.ack(info.ack_tag).await
            } else {
                self.broker.reject(info.ack_tag, false).await
            };
            if let Err(err) = result {
                warn!(task_id = %task_id, error = %err, "failed to finalize late ack");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_broker::InMemoryBroker;
    use foreman_registry::{ExchangeType, Handler, HandlerOutcome, RegistryEntry, TaskMessage};
    use futures::FutureExt;
    use std::sync::Arc as StdArc;

    fn noop_handler() -> Handler {
        StdArc::new(|_a, _k| async { HandlerOutcome::Success(serde_json::Value::Null) }.boxed())
    }

    async fn broker_with_queue(queue: &str) -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange("default", ExchangeType::Direct).await.unwrap();
        broker.declare_queue(queue).await.unwrap();
        broker.bind(queue, "default", queue).await.unwrap();
        broker
    }

    fn no_events() -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher::new(Arc::new(InMemoryBroker::new()), false))
    }

    #[tokio::test]
    async fn unknown_task_is_rejected_without_reaching_ready_queue() {
        let broker = broker_with_queue("work").await;
        let registry = Registry::new();
        let listener = Listener::new(broker.clone(), registry, Serializer::Json, false, no_events());

        let msg = TaskMessage::new("ghost");
        let body = Serializer::Json.encode(&msg).unwrap();
        broker
            .publish("default", "work", body, foreman_broker::PublishProperties::default())
            .await
            .unwrap();

        let (ready_tx, mut ready_rx) = mpsc::channel(4);
        let eta = Arc::new(EtaScheduler::new());
        listener.run("work".into(), 4, ready_tx, eta);

        let received = tokio::time::timeout(std::time::Duration::from_millis(200), ready_rx.recv()).await;
        assert!(received.is_err(), "unknown task should never reach the ready queue");
    }

    #[tokio::test]
    async fn due_task_reaches_ready_queue() {
        let broker = broker_with_queue("work").await;
        let registry = Registry::new();
        registry.register(RegistryEntry::new("add", noop_handler())).unwrap();
        let listener = Listener::new(broker.clone(), registry, Serializer::Json, false, no_events());

        let msg = TaskMessage::new("add");
        let body = Serializer::Json.encode(&msg).unwrap();
        broker
            .publish("default", "work", body, foreman_broker::PublishProperties::default())
            .await
            .unwrap();

        let (ready_tx, mut ready_rx) = mpsc::channel(4);
        let eta = Arc::new(EtaScheduler::new());
        listener.run("work".into(), 4, ready_tx, eta);

        let item = tokio::time::timeout(std::time::Duration::from_millis(200), ready_rx.recv())
            .await
            .expect("should receive")
            .expect("channel open");
        assert_eq!(item.message.name, "add");
    }

    #[tokio::test]
    async fn expired_task_is_rejected_without_reaching_ready_queue() {
        let broker = broker_with_queue("work").await;
        let registry = Registry::new();
        registry.register(RegistryEntry::new("add", noop_handler())).unwrap();
        let listener = Listener::new(broker.clone(), registry, Serializer::Json, false, no_events());

        let mut msg = TaskMessage::new("add");
        msg.expires = Some(SystemTime::now() - std::time::Duration::from_secs(5));
        let body = Serializer::Json.encode(&msg).unwrap();
        broker
            .publish("default", "work", body, foreman_broker::PublishProperties::default())
            .await
            .unwrap();

        let (ready_tx, mut ready_rx) = mpsc::channel(4);
        let eta = Arc::new(EtaScheduler::new());
        listener.run("work".into(), 4, ready_tx, eta);

        let received = tokio::time::timeout(std::time::Duration::from_millis(200), ready_rx.recv()).await;
        assert!(received.is_err(), "expired task should never reach the ready queue");
    }
}
