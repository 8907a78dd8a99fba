use crate::{
    error::AppError,
    models::realtime::LiveMessage,
    services::{
        auth::SessionUser,
        live_view::{LiveView, ViewCommand, ViewOutput},
    },
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 32;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(live_handler))
}

/// WebSocket连接处理器
/// GET /api/live
async fn live_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    user: SessionUser,
) -> Response {
    let connection_id = format!("conn_{}", uuid::Uuid::new_v4());

    info!("Live view upgrade request from user: {} with connection: {}", user.id, connection_id);

    ws.on_upgrade(move |socket| handle_live_connection(socket, state, user, connection_id))
}

/// 处理WebSocket连接
async fn handle_live_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    user: SessionUser,
    connection_id: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let connect = LiveMessage::connect(&connection_id, user.id);
    match serde_json::to_string(&connect) {
        Ok(text) => {
            if sender.send(Message::Text(text)).await.is_err() {
                warn!("Connection {} closed before the handshake", connection_id);
                return;
            }
        }
        Err(e) => {
            error!("Failed to serialize connect message: {}", e);
            return;
        }
    }

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<ViewOutput>();
    let (command_tx, command_rx) = mpsc::channel::<ViewCommand>(COMMAND_BUFFER);

    let view = LiveView::new(
        user,
        state.store.clone(),
        state.feed.clone(),
        state.submission.clone(),
        output_tx.clone(),
    );
    let view_task = tokio::spawn(view.run(command_rx));

    // 发送任务
    let send_connection_id = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(output) = output_rx.recv().await {
            let text = match serde_json::to_string(&output.into_message()) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize live message: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(text)).await.is_err() {
                debug!("Client {} stopped receiving", send_connection_id);
                break;
            }
        }
    });

    // 接收任务
    let recv_connection_id = connection_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    let command = serde_json::from_str::<LiveMessage>(&text)
                        .map_err(AppError::from)
                        .and_then(ViewCommand::from_message);

                    match command {
                        Ok(command) => {
                            if command_tx.send(command).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Invalid message from {}: {}", recv_connection_id, e);
                            let _ = output_tx.send(ViewOutput::Error {
                                code: "INVALID_MESSAGE".to_string(),
                                message: e.user_message(),
                            });
                        }
                    }
                }
                Message::Close(_) => {
                    debug!("Client {} closed the connection", recv_connection_id);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Dropping the command sender ends the view, which releases its subscription.
    if let Err(e) = view_task.await {
        error!("Live view task for {} failed: {}", connection_id, e);
    }

    info!("Live connection {} closed", connection_id);
}
