pub mod acquisition;
pub mod assembler;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod logsink;
pub mod models;
pub mod parser;
pub mod persistence;
pub mod plan;
pub mod render;
pub mod state;
pub mod stats;
pub mod tmy;
pub mod variables;
pub mod workflow;
