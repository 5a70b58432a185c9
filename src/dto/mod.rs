pub mod application_dto;
pub mod conversation_dto;
