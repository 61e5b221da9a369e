pub mod bus;
pub mod config;
pub mod env;
pub mod error;
pub mod ingress;
pub mod model;
pub mod replica;
pub mod service;
pub mod state;

// Supervision seam and retry policy
pub mod backoff;
pub mod supervisor;
