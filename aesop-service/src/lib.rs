pub mod clients;
pub mod config;
pub mod models;
pub mod service;
pub mod stores;
pub mod tasks;
pub mod workflow;

pub use config::Config;
pub use service::{build_router, AppState};
pub use workflow::{build_orchestrator_graph, ChatOutcome, EngineDeps};
