pub mod config;
pub mod cycle;
pub mod deps;
pub mod errors;
pub mod health;
pub mod logging;
pub mod notify;
pub mod orchestrator;
pub mod profile;
pub mod repair;
pub mod report;
pub mod stage;
pub mod store;
