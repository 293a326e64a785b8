//! In-process connector for a `Broker` in the same address space

use super::{
    Broker, BrokerChannel, BrokerConnector, BrokerSession, Delivery, DeliveryTag, QueueInfo,
    QueueName, QueueOptions,
};
use crate::error::DeliveryError;
use async_trait::async_trait;

/// Connects directly to an in-process `Broker`
#[derive(Clone)]
pub struct LocalConnector {
    broker: Broker,
}

impl LocalConnector {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for LocalConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, DeliveryError> {
        let session = self.broker.open()?;
        Ok(Box::new(LocalChannel { session }))
    }

    fn describe(&self) -> String {
        "in-process broker".to_string()
    }
}

/// A `BrokerChannel` backed by a `BrokerSession`
pub struct LocalChannel {
    session: BrokerSession,
}

impl LocalChannel {
    pub fn connection_id(&self) -> u64 {
        self.session.id()
    }
}

#[async_trait]
impl BrokerChannel for LocalChannel {
    async fn declare_queue(
        &mut self,
        queue: &QueueName,
        options: QueueOptions,
    ) -> Result<QueueInfo, DeliveryError> {
        self.session.declare(queue, options)
    }

    async fn publish(
        &mut self,
        queue: &QueueName,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<(), DeliveryError> {
        self.session.publish(queue, body, persistent)
    }

    async fn consume(&mut self, queue: &QueueName, prefetch: u16) -> Result<(), DeliveryError> {
        self.session.consume(queue, prefetch)
    }

    async fn next_delivery(&mut self) -> Result<Delivery, DeliveryError> {
        self.session.next_delivery().await
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), DeliveryError> {
        self.session.ack(tag)
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), DeliveryError> {
        self.session.nack(tag, requeue)
    }

    async fn close(&mut self) -> Result<(), DeliveryError> {
        self.session.close();
        Ok(())
    }
}
