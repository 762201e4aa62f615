use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use shared_models::{auth::User, error::AppError};
use shared_utils::extractor::user_from_token;

use crate::handlers::BookingCellState;
use crate::models::{ClientMessage, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct SocketParams {
    pub token: String,
}

/// `GET /realtime/ws?token=<jwt>`. Browsers cannot set headers on websocket
/// upgrades, so the token travels in the query string.
pub async fn realtime_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BookingCellState>>,
    Query(params): Query<SocketParams>,
) -> Result<Response, AppError> {
    let user = user_from_token(&params.token, &state.config)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: Arc<BookingCellState>, user: User) {
    let (mut outgoing, mut incoming) = socket.split();
    let (connection_id, mut pushed) = state.hub.connect(&user.id).await;
    info!("Realtime session {} started for {}", connection_id, user.id);

    loop {
        tokio::select! {
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let replies = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(message) => state.hub.handle_client_message(connection_id, &user.id, message).await,
                        Err(e) => vec![ServerMessage::Error { message: format!("Unrecognised message: {}", e) }],
                    };
                    if send_all(&mut outgoing, replies).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Realtime session {} read error: {}", connection_id, e);
                    break;
                }
            },
            payload = pushed.recv() => match payload {
                Ok(payload) => {
                    if outgoing.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Realtime session {} dropped {} updates", connection_id, skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let released = state.hub.disconnect(connection_id).await;
    info!(
        "Realtime session {} ended for {} ({} lock(s) released)",
        connection_id, user.id, released.len()
    );
}

async fn send_all<S>(outgoing: &mut S, replies: Vec<ServerMessage>) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    for reply in replies {
        let payload = match serde_json::to_string(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode realtime reply: {}", e);
                continue;
            }
        };
        outgoing.send(Message::Text(payload.into())).await?;
    }
    Ok(())
}
