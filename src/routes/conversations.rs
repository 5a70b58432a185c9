use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::dto::conversation_dto::SendMessageRequest;
use crate::error::Result;
use crate::models::actor::Actor;
use crate::AppState;

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse> {
    let conversations = state.conversation_service.list_for(&actor).await?;
    Ok(Json(conversations))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let messages = state.conversation_service.history(id, &actor).await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let message = state
        .conversation_service
        .send_message(id, &actor, &payload.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}
