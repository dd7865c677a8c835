pub mod backend;
pub mod certificate;
pub mod config;
pub mod funding;
pub mod marker;
pub mod orchestrator;
pub mod registration;
pub mod registry;
pub mod scanner;
pub mod telemetry;
pub mod transaction;
pub mod watcher;
