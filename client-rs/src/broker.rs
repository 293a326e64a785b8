//! Broker connection over WebSocket

use crate::error::ClientError;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokenbus::broker::{
    BrokerChannel, BrokerConnector, Delivery, DeliveryTag, QueueInfo, QueueName, QueueOptions,
};
use tokenbus::error::DeliveryError;
use tokenbus::server::protocol::{
    decode_body, encode_body, error_from_reply, ClientMessage, ServerMessage,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens channels to a broker served at a `ws://` or `wss://` URL
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    request_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ClientError> {
        let url = url.into();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ClientError::Config(format!(
                "broker url must start with ws:// or wss://: {}",
                url
            )));
        }
        Ok(Self {
            url,
            request_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BrokerConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, DeliveryError> {
        let (socket, _) = timeout(self.request_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| DeliveryError::BrokerUnreachable("connect timed out".to_string()))?
            .map_err(|e| DeliveryError::BrokerUnreachable(e.to_string()))?;

        debug!(url = %self.url, "Broker socket open");

        Ok(Box::new(WsChannel {
            socket,
            pending: VecDeque::new(),
            request_timeout: self.request_timeout,
            broken: false,
        }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// One broker connection
///
/// Requests are answered in order. Deliveries that arrive while a request
/// is waiting for its reply are buffered for `next_delivery`.
pub struct WsChannel {
    socket: Socket,
    pending: VecDeque<Delivery>,
    request_timeout: Duration,
    broken: bool,
}

impl WsChannel {
    fn check_open(&self) -> Result<(), DeliveryError> {
        if self.broken {
            return Err(DeliveryError::BrokerUnreachable("connection closed".to_string()));
        }
        Ok(())
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), DeliveryError> {
        self.check_open()?;
        let text = serde_json::to_string(msg)
            .map_err(|e| DeliveryError::MalformedEnvelope(e.to_string()))?;

        if let Err(e) = self.socket.send(Message::Text(text)).await {
            self.broken = true;
            return Err(DeliveryError::BrokerUnreachable(e.to_string()));
        }
        Ok(())
    }

    /// Next protocol frame from the server
    ///
    /// Cancel-safe: a frame is only consumed once it has been fully read.
    async fn recv(&mut self) -> Result<ServerMessage, DeliveryError> {
        self.check_open()?;
        loop {
            let frame = match self.socket.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    self.broken = true;
                    return Err(DeliveryError::BrokerUnreachable(e.to_string()));
                }
                None => {
                    self.broken = true;
                    return Err(DeliveryError::BrokerUnreachable(
                        "connection closed by broker".to_string(),
                    ));
                }
            };

            let parsed = match frame {
                Message::Text(text) => serde_json::from_str::<ServerMessage>(&text),
                Message::Binary(data) => serde_json::from_slice::<ServerMessage>(&data),
                Message::Close(_) => {
                    self.broken = true;
                    return Err(DeliveryError::BrokerUnreachable(
                        "connection closed by broker".to_string(),
                    ));
                }
                // Ping/pong are answered by tungstenite
                _ => continue,
            };

            match parsed {
                Ok(msg) => return Ok(msg),
                Err(e) => warn!(error = %e, "Ignoring unparseable server frame"),
            }
        }
    }

    /// Send a request and wait for its reply
    async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage, DeliveryError> {
        self.send(&msg).await?;

        match timeout(self.request_timeout, self.reply()).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    if e.is_connection_loss() {
                        self.broken = true;
                    }
                }
                result
            }
            Err(_) => {
                // A late reply would be mistaken for the next one
                self.broken = true;
                Err(DeliveryError::BrokerUnreachable("request timed out".to_string()))
            }
        }
    }

    /// The next non-delivery frame; deliveries seen on the way are buffered
    async fn reply(&mut self) -> Result<ServerMessage, DeliveryError> {
        loop {
            match self.recv().await? {
                ServerMessage::Deliver {
                    delivery_tag,
                    redelivered,
                    body,
                } => {
                    let delivery = to_delivery(delivery_tag, redelivered, &body)?;
                    self.pending.push_back(delivery);
                }
                ServerMessage::Error { message, code } => {
                    return Err(error_from_reply(code.as_deref(), message));
                }
                reply => return Ok(reply),
            }
        }
    }
}

fn to_delivery(tag: DeliveryTag, redelivered: bool, body: &str) -> Result<Delivery, DeliveryError> {
    Ok(Delivery {
        tag,
        redelivered,
        body: decode_body(body)?,
    })
}

fn unexpected(reply: ServerMessage) -> DeliveryError {
    DeliveryError::Rejected(format!("unexpected reply: {:?}", reply))
}

#[async_trait]
impl BrokerChannel for WsChannel {
    async fn declare_queue(
        &mut self,
        queue: &QueueName,
        options: QueueOptions,
    ) -> Result<QueueInfo, DeliveryError> {
        let reply = self
            .request(ClientMessage::Declare {
                queue: queue.to_string(),
                durable: options.durable,
            })
            .await?;

        match reply {
            ServerMessage::Declared {
                durable,
                message_count,
                ..
            } => Ok(QueueInfo {
                name: queue.clone(),
                durable,
                message_count,
                // Not reported over the wire
                consumer_count: 0,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn publish(
        &mut self,
        queue: &QueueName,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<(), DeliveryError> {
        let reply = self
            .request(ClientMessage::Publish {
                queue: queue.to_string(),
                body: encode_body(&body),
                persistent,
            })
            .await?;

        match reply {
            ServerMessage::Published { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn consume(&mut self, queue: &QueueName, prefetch: u16) -> Result<(), DeliveryError> {
        let reply = self
            .request(ClientMessage::Consume {
                queue: queue.to_string(),
                prefetch,
            })
            .await?;

        match reply {
            ServerMessage::ConsumeOk { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn next_delivery(&mut self) -> Result<Delivery, DeliveryError> {
        if let Some(delivery) = self.pending.pop_front() {
            return Ok(delivery);
        }

        loop {
            match self.recv().await? {
                ServerMessage::Deliver {
                    delivery_tag,
                    redelivered,
                    body,
                } => return to_delivery(delivery_tag, redelivered, &body),
                ServerMessage::Error { message, code } => {
                    let err = error_from_reply(code.as_deref(), message);
                    if err.is_connection_loss() {
                        self.broken = true;
                    }
                    return Err(err);
                }
                other => debug!(reply = ?other, "Ignoring reply while waiting for a delivery"),
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), DeliveryError> {
        self.send(&ClientMessage::Ack { delivery_tag: tag }).await
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), DeliveryError> {
        self.send(&ClientMessage::Nack {
            delivery_tag: tag,
            requeue,
        })
        .await
    }

    async fn close(&mut self) -> Result<(), DeliveryError> {
        if self.broken {
            return Ok(());
        }
        self.broken = true;
        self.pending.clear();
        self.socket
            .close(None)
            .await
            .map_err(|e| DeliveryError::BrokerUnreachable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_requires_ws_scheme() {
        assert!(WsConnector::new("ws://localhost:3000/ws", Duration::from_secs(1)).is_ok());
        assert!(WsConnector::new("wss://bus.example.com/ws", Duration::from_secs(1)).is_ok());

        let err = WsConnector::new("http://localhost:3000/ws", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_to_delivery_rejects_bad_body() {
        let delivery = to_delivery(3, true, "e30=").unwrap();
        assert_eq!(delivery.tag, 3);
        assert!(delivery.redelivered);
        assert_eq!(delivery.body, b"{}");

        assert!(matches!(
            to_delivery(4, false, "%%%"),
            Err(DeliveryError::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let connector = WsConnector::new("ws://127.0.0.1:9/ws", Duration::from_millis(500)).unwrap();
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_connection_loss());
    }
}
