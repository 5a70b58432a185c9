pub mod actor;
pub mod application;
pub mod conversation;
pub mod message;
pub mod payment;
pub mod profile;
pub mod rental;
pub mod room;
