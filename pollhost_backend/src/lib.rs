pub mod config;
pub mod generator;
pub mod llm_client;
pub mod poll;
pub mod runtime;
pub mod server;
pub mod state;
pub mod store;
pub mod workers;
