pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod models;
pub mod observability;
pub mod runtime;
pub mod state;
pub mod store;
