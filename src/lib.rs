pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod utils;

use std::sync::Arc;

use crate::config::Config;
use crate::services::{
    application_service::ApplicationService, conversation_service::ConversationService,
};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub jwt_secret: Arc<str>,
    pub application_service: ApplicationService,
    pub conversation_service: ConversationService,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        let application_service = ApplicationService::new(store.clone());
        let conversation_service = ConversationService::new(store, config.reconnect_delay);

        Self {
            jwt_secret: Arc::from(config.jwt_secret.as_str()),
            application_service,
            conversation_service,
        }
    }
}
