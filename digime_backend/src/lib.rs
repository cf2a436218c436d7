pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod http_client;
pub mod llm_client;
pub mod orchestrator;
pub mod runtime;
pub mod server;
pub mod style;
pub mod transport;
