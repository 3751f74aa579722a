// src/lib.rs
pub mod aggregate;
pub mod config;
pub mod error;
pub mod fetch;
pub mod history;
pub mod labor;
pub mod merge;
pub mod pipeline;
pub mod process;
pub mod schema;
pub mod xport;
