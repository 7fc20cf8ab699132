use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;

use crate::AppState;

// ═══════════════════════════════════════════════════════════════
//  WebSocket: /topics/{topic}/poll
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_poll(
    State(state): State<AppState>,
    Path(path_topic): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| poll_connection(socket, state, path_topic))
}

/// The first text frame names the topic to poll. Later frames are
/// ignored; the socket closes when the subscription ends or the gateway
/// shuts down.
async fn poll_connection(mut socket: WebSocket, state: AppState, path_topic: String) {
    let topic = loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            msg = socket.recv() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => break text.as_str().trim().to_string(),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        }
    };
    if topic != path_topic {
        tracing::debug!(path = %path_topic, topic = %topic, "polling topic named by client");
    }

    let mut subscription = match state.poll.subscribe(&topic).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "poll subscribe failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }

            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },

            snapshot = subscription.next() => match snapshot {
                Some(snapshot) => {
                    if socket.send(Message::Text(snapshot.payload.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    match state.poll.unsubscribe(&topic, subscription.id()).await {
        Ok(true) => tracing::debug!(topic = %topic, id = subscription.id(), "poll socket closed"),
        Ok(false) => {}
        Err(e) => tracing::debug!(topic = %topic, error = %e, "unsubscribe after close"),
    }
}
