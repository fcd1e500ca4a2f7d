pub mod config;
pub mod llm;
pub mod server;
pub mod telemetry;
