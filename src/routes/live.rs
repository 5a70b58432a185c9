//! WebSocket bridge for a [`ConversationSession`].
//!
//! Server frames: `message`, `resync`, `status`, `error`. Client frames:
//! `draft` and `send`. The session is torn down when the socket closes.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Extension,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::dto::conversation_dto::{ClientFrame, ServerFrame};
use crate::error::Result;
use crate::models::actor::Actor;
use crate::services::conversation_session::ConversationSession;
use crate::AppState;

pub async fn conversation_live(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse> {
    let session = state.conversation_service.open(id, &actor).await?;
    Ok(ws.on_upgrade(move |socket| serve_session(socket, session)))
}

async fn push(sink: &mut SplitSink<WebSocket, WsMessage>, frame: &ServerFrame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode live frame");
            return true;
        }
    };
    sink.send(WsMessage::Text(text)).await.is_ok()
}

async fn handle_client_frame(session: &ConversationSession, text: &str) -> Option<ServerFrame> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(ServerFrame::Error {
                error: format!("Invalid frame: {}", e),
            })
        }
    };

    let result = match frame {
        ClientFrame::Draft { content } => {
            session.set_draft(content);
            return None;
        }
        ClientFrame::Send { content: Some(content) } => session.send(content).await,
        ClientFrame::Send { content: None } => session.send_draft().await,
    };

    match result {
        Ok(_) => None,
        Err(e) => Some(ServerFrame::Error {
            error: e.to_string(),
        }),
    }
}

async fn serve_session(socket: WebSocket, session: ConversationSession) {
    let conversation_id = session.conversation().id;
    let (mut sink, mut stream) = socket.split();
    let mut updates = session.updates();
    let mut status = session.status();

    let greeting = [
        ServerFrame::Resync {
            messages: session.messages(),
        },
        ServerFrame::Status {
            status: *status.borrow_and_update(),
        },
    ];
    for frame in &greeting {
        if !push(&mut sink, frame).await {
            session.close().await;
            return;
        }
    }

    loop {
        let outgoing = tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => Some(ServerFrame::from(update)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%conversation_id, skipped, "Live client lagging, sending full list");
                    Some(ServerFrame::Resync { messages: session.messages() })
                }
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => match changed {
                Ok(()) => Some(ServerFrame::Status { status: *status.borrow_and_update() }),
                Err(_) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => handle_client_frame(&session, &text).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    tracing::debug!(%conversation_id, error = %e, "Live socket error");
                    break;
                }
            },
        };

        if let Some(frame) = outgoing {
            if !push(&mut sink, &frame).await {
                break;
            }
        }
    }

    session.close().await;
    tracing::debug!(%conversation_id, "Live client disconnected");
}
