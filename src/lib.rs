pub mod app;
pub mod cache;
pub mod capture;
pub mod config;
pub mod errors;
pub mod gate;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod publish;
pub mod retry;
pub mod sandbox;
pub mod server;
pub mod store;
