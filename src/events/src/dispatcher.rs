//! Publishes monitoring events over the broker. Fire-and-forget: a
//! publish failure is logged and never propagates back to task execution.

use crate::event::{Event, EventRecord};
use foreman_broker::{Broker, PublishProperties};
use std::sync::Arc;
use tracing::warn;

const EVENT_EXCHANGE: &str = "foreman.events";
const EVENT_ROUTING_KEY: &str = "worker.event";

/// Disabled by default (`send_events = false`); when enabled, every call
/// publishes independently and never blocks the caller on broker health.
pub struct EventDispatcher {
    broker: Arc<dyn Broker>,
    enabled: bool,
}

impl EventDispatcher {
    pub fn new(broker: Arc<dyn Broker>, enabled: bool) -> Self {
        Self { broker, enabled }
    }

    pub async fn declare_topology(&self) -> Result<(), foreman_registry::ForemanError> {
        if !self.enabled {
            return Ok(());
        }
        self.broker
            .declare_exchange(EVENT_EXCHANGE, foreman_registry::ExchangeType::Topic)
            .await
    }

    pub async fn emit(&self, event: Event) {
        if !self.enabled {
            return;
        }

        let record = EventRecord::now(event);
        let body = match serde_json::to_vec(&record) {
            Ok(b) => b,
            Err(err) => {
                warn!(error = %err, "failed to encode event record");
                return;
            }
        };

        let properties = PublishProperties {
            content_type: "application/json".to_string(),
            delivery_mode: 1,
        };

        if let Err(err) = self
            .broker
            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, body, properties)
            .await
        {
            warn!(error = %err, "failed to publish event, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_broker::InMemoryBroker;

    #[tokio::test]
    async fn disabled_dispatcher_never_touches_broker() {
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = EventDispatcher::new(broker, false);
        dispatcher
            .emit(Event::WorkerOnline {
                worker_id: uuid::Uuid::new_v4(),
                hostname: "host".into(),
            })
            .await;
        // No panic, no assertion target: absence of a broker call is the point.
    }

    #[tokio::test]
    async fn enabled_dispatcher_publishes_without_panicking_on_no_consumers() {
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = EventDispatcher::new(broker, true);
        dispatcher.declare_topology().await.unwrap();
        dispatcher
            .emit(Event::TaskReceived {
                task_id: uuid::Uuid::new_v4(),
                task_name: "add".into(),
            })
            .await;
    }
}
