pub mod applications;
pub mod conversations;
pub mod health;
pub mod live;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::middleware::auth::require_bearer_auth;
use crate::AppState;

/// Full HTTP surface. Everything under `/api` needs a bearer token.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/rooms/:room_id/applications",
            get(applications::list_room_applications).post(applications::submit_application),
        )
        .route(
            "/api/rooms/:room_id/applications/mine",
            get(applications::my_application_for_room),
        )
        .route("/api/applications", get(applications::list_my_applications))
        .route(
            "/api/applications/:id/accept",
            post(applications::accept_application),
        )
        .route(
            "/api/applications/:id/reject",
            post(applications::reject_application),
        )
        .route(
            "/api/applications/:id/finalize",
            get(applications::finalize_preview).post(applications::finalize_payment),
        )
        .route("/api/conversations", get(conversations::list_conversations))
        .route(
            "/api/conversations/:id/messages",
            get(conversations::get_messages).post(conversations::send_message),
        )
        .route("/api/conversations/:id/live", get(live::conversation_live))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer_auth,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(api)
        .with_state(state)
}
