pub mod conversation;
pub mod error;
pub mod events;
pub mod poller;
pub mod session;
pub mod settings;
pub mod transport;
pub mod ui;
