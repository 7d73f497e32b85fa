pub mod claim;
pub mod config;
pub mod database;
pub mod errors;
pub mod handler;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod registry;
pub mod worker;
