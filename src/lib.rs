pub mod config;
pub mod controller;
pub mod handler;
pub mod informer;
pub mod queue;
pub mod reconcile;
pub mod types;
