pub mod bootstrap;
pub mod dealer;
pub mod dispatcher;
pub mod events;
pub mod handler;
pub mod http;
pub mod palette;
pub mod session;
pub mod spotify;
