use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::dto::application_dto::{
    AcceptApplicationRequest, HasAppliedResponse, SubmitApplicationRequest,
};
use crate::error::Result;
use crate::models::actor::Actor;
use crate::AppState;

pub async fn submit_application(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<SubmitApplicationRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let application = state
        .application_service
        .submit(room_id, &actor, payload.message)
        .await?;
    Ok((StatusCode::CREATED, Json(application)))
}

pub async fn list_room_applications(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(room_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let applications = state
        .application_service
        .list_for_room(room_id, &actor)
        .await?;
    Ok(Json(applications))
}

pub async fn my_application_for_room(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(room_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let existing = state.application_service.has_applied(room_id, &actor).await?;
    Ok(Json(HasAppliedResponse {
        applied: existing.is_some(),
        status: existing.map(|a| a.status),
    }))
}

pub async fn list_my_applications(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse> {
    let applications = state.application_service.list_for_student(&actor).await?;
    Ok(Json(applications))
}

pub async fn accept_application(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptApplicationRequest>,
) -> Result<impl IntoResponse> {
    let application = state
        .application_service
        .accept(id, payload.room_id, payload.student_id, &actor)
        .await?;
    Ok(Json(application))
}

pub async fn reject_application(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let application = state.application_service.reject(id, &actor).await?;
    Ok(Json(application))
}

pub async fn finalize_preview(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let preview = state.application_service.finalize_preview(id, &actor).await?;
    Ok(Json(preview))
}

pub async fn finalize_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let rental = state.application_service.finalize_payment(id, &actor).await?;
    Ok((StatusCode::CREATED, Json(rental)))
}
