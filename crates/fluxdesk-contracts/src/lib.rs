pub mod cache;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod events;
pub mod history;
pub mod request;
