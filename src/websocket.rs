use crate::broadcaster::{PriceBroadcaster, PriceEvent};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Control messages exchanged over the socket. Price events are sent as
/// serialized `PriceEvent`s (`resync`, `price_update`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        opportunity_id: Uuid,
        /// Last timestamp the client already has, for reconnects
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { opportunity_id: Uuid },
    #[serde(rename = "subscribed")]
    Subscribed {
        opportunity_id: Uuid,
        watchers: usize,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { opportunity_id: Uuid },
    #[serde(rename = "error")]
    Error { message: String },
}

type WsSender = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

async fn send_json<T: Serialize>(sender: &WsSender, value: &T) -> AppResult<()> {
    let json = serde_json::to_string(value)?;
    sender
        .lock()
        .await
        .send(Message::Text(json))
        .await
        .map_err(|e| AppError::Message(format!("WebSocket send failed: {}", e)))
}

/// WebSocket server relaying price events to connected clients
#[derive(Clone)]
pub struct WebSocketServer {
    broadcaster: PriceBroadcaster,
}

impl WebSocketServer {
    pub fn new(broadcaster: PriceBroadcaster) -> Self {
        Self { broadcaster }
    }

    /// Handle a new WebSocket connection until the client goes away
    pub async fn handle_connection(&self, stream: TcpStream) -> AppResult<()> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| AppError::Message(format!("WebSocket handshake failed: {}", e)))?;

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let ws_sender: WsSender = Arc::new(Mutex::new(ws_sender));
        let client_id = Uuid::new_v4();

        // Forwarding task per subscribed opportunity
        let mut forwarders: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

        info!("New WebSocket connection: {}", client_id);

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::Subscribe {
                        opportunity_id,
                        since,
                    }) => {
                        if let Some(previous) = forwarders.remove(&opportunity_id) {
                            previous.abort();
                        }
                        match self.subscribe(client_id, opportunity_id, since, &ws_sender).await {
                            Ok(handle) => {
                                forwarders.insert(opportunity_id, handle);
                            }
                            Err(e) => {
                                let _ = send_json(
                                    &ws_sender,
                                    &WsMessage::Error {
                                        message: e.to_string(),
                                    },
                                )
                                .await;
                            }
                        }
                    }
                    Ok(WsMessage::Unsubscribe { opportunity_id }) => {
                        if let Some(handle) = forwarders.remove(&opportunity_id) {
                            handle.abort();
                        }
                        info!("Client {} unsubscribed from {}", client_id, opportunity_id);
                        if let Err(e) =
                            send_json(&ws_sender, &WsMessage::Unsubscribed { opportunity_id }).await
                        {
                            warn!("Failed to send ack: {}", e);
                        }
                    }
                    Ok(_) => {
                        warn!("Unexpected message type from client {}", client_id);
                    }
                    Err(_) => {
                        warn!("Failed to parse message from client {}: {}", client_id, text);
                        let _ = send_json(
                            &ws_sender,
                            &WsMessage::Error {
                                message: "Invalid message format".to_string(),
                            },
                        )
                        .await;
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed: {}", client_id);
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        // Dropping each subscription releases its watcher count
        for (_, handle) in forwarders {
            handle.abort();
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        client_id: Uuid,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
        ws_sender: &WsSender,
    ) -> AppResult<JoinHandle<()>> {
        let mut subscription = self.broadcaster.subscribe(opportunity_id, since).await?;
        let watchers = self.broadcaster.connection_count(opportunity_id).await;

        send_json(
            ws_sender,
            &WsMessage::Subscribed {
                opportunity_id,
                watchers,
            },
        )
        .await?;
        info!("Client {} subscribed to {}", client_id, opportunity_id);

        let sender = ws_sender.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if let Err(e) = send_json(&sender, &event).await {
                    debug!("Stopping relay to client {}: {}", client_id, e);
                    break;
                }
                if let PriceEvent::Update(update) = &event {
                    debug!(
                        "Relayed price {} for {} to client {}",
                        update.price, opportunity_id, client_id
                    );
                }
            }
        }))
    }
}
