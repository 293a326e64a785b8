//! WebSocket face of the broker
//!
//! Each socket is one broker connection. Closing the socket, from either
//! side, requeues whatever the client had not settled.

use super::protocol::{decode_body, encode_body, ClientMessage, ServerMessage};
use super::AppState;
use crate::broker::{Broker, BrokerSession, QueueName, QueueOptions};
use crate::error::DeliveryError;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broker))
}

/// What to do after handling one client frame
enum Outcome {
    Reply(ServerMessage),
    Silent,
    /// Reply, then close the connection
    Fatal(ServerMessage),
}

async fn handle_socket(socket: WebSocket, broker: Broker) {
    let (mut sender, mut receiver) = socket.split();

    let mut session = match broker.open() {
        Ok(session) => session,
        Err(e) => {
            let _ = send(&mut sender, &ServerMessage::error(&e)).await;
            let _ = sender.close().await;
            return;
        }
    };
    let conn_id = session.id();
    let mut closed = session.close_signal();

    info!(connection_id = conn_id, "Broker client connected");

    loop {
        let has_credit = session.has_credit();

        tokio::select! {
            incoming = receiver.next() => {
                let msg = match incoming {
                    Some(Ok(Message::Text(text))) => serde_json::from_str::<ClientMessage>(&text),
                    Some(Ok(Message::Binary(data))) => serde_json::from_slice::<ClientMessage>(&data),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Handled automatically by axum
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(connection_id = conn_id, error = %e, "WebSocket error");
                        break;
                    }
                };

                let outcome = match msg {
                    Ok(msg) => handle_client_message(msg, &mut session),
                    Err(e) => Outcome::Reply(ServerMessage::Error {
                        message: format!("Invalid message: {}", e),
                        code: None,
                    }),
                };

                match outcome {
                    Outcome::Reply(reply) => {
                        if send(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Outcome::Silent => {}
                    Outcome::Fatal(reply) => {
                        let _ = send(&mut sender, &reply).await;
                        break;
                    }
                }
            }
            delivery = session.next_delivery(), if has_credit => {
                match delivery {
                    Ok(delivery) => {
                        let msg = ServerMessage::Deliver {
                            delivery_tag: delivery.tag,
                            redelivered: delivery.redelivered,
                            body: encode_body(&delivery.body),
                        };
                        if send(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_connection_loss() => {
                        let _ = send(&mut sender, &ServerMessage::error(&e)).await;
                        break;
                    }
                    Err(e) => debug!(connection_id = conn_id, error = %e, "No delivery"),
                }
            }
            _ = closed_by_broker(&mut closed) => {
                let err = DeliveryError::BrokerUnreachable("connection closed by broker".to_string());
                let _ = send(&mut sender, &ServerMessage::error(&err)).await;
                break;
            }
        }
    }

    // Requeues anything unacked
    session.close();
    let _ = sender.close().await;
    debug!(connection_id = conn_id, "Broker client disconnected");
}

async fn closed_by_broker(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

fn handle_client_message(msg: ClientMessage, session: &mut BrokerSession) -> Outcome {
    let result = match msg {
        ClientMessage::Declare { queue, durable } => parse_queue(&queue).and_then(|name| {
            let info = session.declare(&name, QueueOptions { durable })?;
            Ok(ServerMessage::Declared {
                queue,
                durable: info.durable,
                message_count: info.message_count,
            })
        }),
        ClientMessage::Publish {
            queue,
            body,
            persistent,
        } => parse_queue(&queue).and_then(|name| {
            session.publish(&name, decode_body(&body)?, persistent)?;
            Ok(ServerMessage::Published { queue })
        }),
        ClientMessage::Consume { queue, prefetch } => parse_queue(&queue).and_then(|name| {
            session.consume(&name, prefetch)?;
            Ok(ServerMessage::ConsumeOk { queue, prefetch })
        }),
        ClientMessage::Ack { delivery_tag } => {
            return settle_outcome(session.ack(delivery_tag));
        }
        ClientMessage::Nack {
            delivery_tag,
            requeue,
        } => {
            return settle_outcome(session.nack(delivery_tag, requeue));
        }
        ClientMessage::Ping { seq } => Ok(ServerMessage::Pong { seq }),
    };

    match result {
        Ok(reply) => Outcome::Reply(reply),
        Err(e) if e.is_connection_loss() => Outcome::Fatal(ServerMessage::error(&e)),
        Err(e) => Outcome::Reply(ServerMessage::error(&e)),
    }
}

/// A bad settlement is a protocol violation and closes the connection
fn settle_outcome(result: Result<(), DeliveryError>) -> Outcome {
    match result {
        Ok(()) => Outcome::Silent,
        Err(e) => Outcome::Fatal(ServerMessage::error(&e)),
    }
}

fn parse_queue(queue: &str) -> Result<QueueName, DeliveryError> {
    QueueName::parse(queue)
        .map_err(|e| DeliveryError::PreconditionFailed(format!("invalid queue name: {}", e)))
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode server message");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
