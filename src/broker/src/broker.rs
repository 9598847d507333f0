//! The broker interface consumed by the Listener, Beat, and Event
//! Dispatcher.
//!
//! The wire protocol itself is out of scope: any AMQP-like broker
//! suffices. `consume` hands back an async channel rather than taking a
//! callback, since every caller in this crate already lives inside a
//! `tokio::select!` loop that can read from one.

use async_trait::async_trait;
use foreman_registry::{ExchangeType, ForemanError};
use tokio::sync::mpsc;

/// One delivered message, plus the metadata needed to ack or reject it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub content_type: String,
    pub ack_tag: u64,
    pub redelivered: bool,
    pub routing_key: String,
    pub queue: String,
}

/// Properties attached to a published message.
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    pub content_type: String,
    pub delivery_mode: u8,
}

/// The broker transport contract. Implementations own connection
/// lifecycle and topology declaration; the core only ever talks to this
/// trait.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), ForemanError>;
    async fn close(&self) -> Result<(), ForemanError>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<(), ForemanError>;
    async fn declare_queue(&self, name: &str) -> Result<(), ForemanError>;
    async fn bind(&self, queue: &str, exchange: &str, binding_key: &str)
        -> Result<(), ForemanError>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged
    /// deliveries outstanding. Returns a receiver the caller drains in its
    /// own loop; dropping the receiver stops consumption.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<mpsc::Receiver<Delivery>, ForemanError>;

    async fn ack(&self, tag: u64) -> Result<(), ForemanError>;
    async fn reject(&self, tag: u64, requeue: bool) -> Result<(), ForemanError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<(), ForemanError>;
}
