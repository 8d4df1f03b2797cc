pub mod chat;
pub mod notification;
pub mod session;
