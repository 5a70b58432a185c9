pub mod application_service;
pub mod conversation_service;
pub mod conversation_session;
