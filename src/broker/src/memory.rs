//! An in-process broker used for tests, local development, and the
//! `foreman-worker --broker memory` mode.
//!
//! Implements the same topology, prefetch, and ack/reject semantics a real
//! AMQP-like broker would provide, gated by a [`tokio::sync::Semaphore`]
//! per consumer so prefetch accounting lives in the broker's own delivery
//! discipline, not duplicated in the Listener.

use crate::broker::{Broker, Delivery, PublishProperties};
use async_trait::async_trait;
use foreman_registry::{ExchangeType, ForemanError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

struct Binding {
    queue: String,
    exchange: String,
    binding_key: String,
}

struct UnackedEntry {
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Inner {
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    pending_backlog: HashMap<String, Option<mpsc::UnboundedReceiver<Delivery>>>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, UnackedEntry>,
    connected: bool,
}

/// A single-process broker backed by in-memory channels.
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    next_tag: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_tag: AtomicU64::new(1),
        }
    }

    fn topic_matches(binding_key: &str, routing_key: &str) -> bool {
        let pattern: Vec<&str> = binding_key.split('.').collect();
        let words: Vec<&str> = routing_key.split('.').collect();
        Self::match_words(&pattern, &words)
    }

    fn match_words(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.first() {
            None => words.is_empty(),
            Some(&"#") => {
                if pattern.len() == 1 {
                    return true;
                }
                (0..=words.len()).any(|i| Self::match_words(&pattern[1..], &words[i..]))
            }
            Some(&"*") => {
                !words.is_empty() && Self::match_words(&pattern[1..], &words[1..])
            }
            Some(seg) => {
                !words.is_empty() && *seg == words[0] && Self::match_words(&pattern[1..], &words[1..])
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), ForemanError> {
        self.inner.lock().await.connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), ForemanError> {
        self.inner.lock().await.connected = false;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<(), ForemanError> {
        self.inner.lock().await.exchanges.insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), ForemanError> {
        let mut inner = self.inner.lock().await;
        if inner.queues.contains_key(name) {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.queues.insert(name.to_string(), tx);
        inner.pending_backlog.insert(name.to_string(), Some(rx));
        Ok(())
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), ForemanError> {
        self.inner.lock().await.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            binding_key: binding_key.to_string(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<mpsc::Receiver<Delivery>, ForemanError> {
        let mut backlog_rx = {
            let mut inner = self.inner.lock().await;
            inner
                .pending_backlog
                .get_mut(queue)
                .and_then(|slot| slot.take())
                .ok_or_else(|| {
                    ForemanError::BrokerConnection(format!(
                        "queue {queue} has no pending backlog (already consumed or undeclared)"
                    ))
                })?
        };

        let semaphore = Arc::new(Semaphore::new(prefetch.max(1)));
        let (out_tx, out_rx) = mpsc::channel(prefetch.max(1));
        let queue_name = queue.to_string();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            loop {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let mut delivery = match backlog_rx.recv().await {
                    Some(d) => d,
                    None => break,
                };
                delivery.queue = queue_name.clone();
                inner.lock().await.unacked.insert(
                    delivery.ack_tag,
                    UnackedEntry {
                        delivery: delivery.clone(),
                        _permit: permit,
                    },
                );
                if out_tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });

        Ok(out_rx)
    }

    async fn ack(&self, tag: u64) -> Result<(), ForemanError> {
        self.inner.lock().await.unacked.remove(&tag);
        Ok(())
    }

    async fn reject(&self, tag: u64, requeue: bool) -> Result<(), ForemanError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.unacked.remove(&tag) {
            if requeue {
                if let Some(sender) = inner.queues.get(&entry.delivery.queue) {
                    let mut redelivered = entry.delivery;
                    redelivered.redelivered = true;
                    let _ = sender.send(redelivered);
                }
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<(), ForemanError> {
        let inner = self.inner.lock().await;
        let kind = inner
            .exchanges
            .get(exchange)
            .copied()
            .unwrap_or(ExchangeType::Direct);

        for binding in inner.bindings.iter().filter(|b| b.exchange == exchange) {
            let matches = match kind {
                ExchangeType::Fanout => true,
                ExchangeType::Direct => binding.binding_key == routing_key,
                ExchangeType::Topic => Self::topic_matches(&binding.binding_key, routing_key),
            };
            if !matches {
                continue;
            }
            if let Some(sender) = inner.queues.get(&binding.queue) {
                let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                let delivery = Delivery {
                    body: body.clone(),
                    content_type: properties.content_type.clone(),
                    ack_tag: tag,
                    redelivered: false,
                    routing_key: routing_key.to_string(),
                    queue: binding.queue.clone(),
                };
                let _ = sender.send(delivery);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_exchange_delivers_on_exact_match() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("default", ExchangeType::Direct).await.unwrap();
        broker.declare_queue("work").await.unwrap();
        broker.bind("work", "default", "work").await.unwrap();

        broker
            .publish("default", "work", b"hello".to_vec(), PublishProperties::default())
            .await
            .unwrap();

        let mut rx = broker.consume("work", 4).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body, b"hello");
    }

    #[tokio::test]
    async fn fanout_delivers_to_every_bound_queue() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", ExchangeType::Fanout).await.unwrap();
        broker.declare_queue("a").await.unwrap();
        broker.declare_queue("b").await.unwrap();
        broker.bind("a", "events", "").await.unwrap();
        broker.bind("b", "events", "").await.unwrap();

        broker
            .publish("events", "anything", b"x".to_vec(), PublishProperties::default())
            .await
            .unwrap();

        let mut rx_a = broker.consume("a", 1).await.unwrap();
        let mut rx_b = broker.consume("b", 1).await.unwrap();
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn topic_wildcard_matches_single_segment() {
        assert!(InMemoryBroker::topic_matches("task.*.completed", "task.add.completed"));
        assert!(!InMemoryBroker::topic_matches("task.*.completed", "task.add.sub.completed"));
        assert!(InMemoryBroker::topic_matches("task.#", "task.add.sub.completed"));
    }

    #[tokio::test]
    async fn prefetch_caps_in_flight_deliveries() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("default", ExchangeType::Direct).await.unwrap();
        broker.declare_queue("work").await.unwrap();
        broker.bind("work", "default", "work").await.unwrap();

        for i in 0..5 {
            broker
                .publish("default", "work", vec![i], PublishProperties::default())
                .await
                .unwrap();
        }

        let mut rx = broker.consume("work", 2).await.unwrap();
        let first = rx.recv().await.unwrap();
        let _second = rx.recv().await.unwrap();

        // A third delivery should not arrive until one of the first two is acked.
        let third = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(third.is_err(), "third delivery arrived before any ack freed a permit");

        broker.ack(first.ack_tag).await.unwrap();
        let third = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
        assert!(third.is_ok());
    }
}
