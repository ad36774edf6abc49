pub mod assembler;
pub mod classifier;
pub mod config;
pub mod error;
pub mod json_faker;
pub mod logging;
pub mod mapper;
pub mod message;
pub mod patient;
pub mod payer;
pub mod pipeline;
pub mod reader;
pub mod reporter;
pub mod schema;
pub mod sink;
pub mod transform;
