pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod parsers;
pub mod prompt;
pub mod salvage;
pub mod sanitize;
pub mod task;
pub mod validate;
pub mod writer;
