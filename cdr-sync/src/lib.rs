pub mod client;
pub mod config;
pub mod directory;
pub mod driver;
pub mod error;
pub mod handlers;
pub mod interactions;
pub mod numbers;
pub mod origination;
pub mod resolver;
pub mod source;
