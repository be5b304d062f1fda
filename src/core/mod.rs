pub mod config;
pub mod delta;
pub mod message;
pub mod store;
pub mod transport;
pub mod widget;
