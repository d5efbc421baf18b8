// Library interface for testing

// Declare all modules
pub mod capture;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod constants;
pub mod db;
pub mod ingest;
pub mod queue;
pub mod schema;
pub mod service;
pub mod store;
pub mod submission;
pub mod sync;
pub mod update;

pub mod queries {
    pub mod captures;
    pub mod ddl;
    pub mod interventions;
    pub mod metadata;
}

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

// Re-export the expected database version for convenience
pub use constants::EXPECTED_DB_VERSION;
