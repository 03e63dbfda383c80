pub mod config;
pub mod notification;
pub mod platform;
pub mod protocol;
pub mod state;
