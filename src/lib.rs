pub mod app;
pub mod builder;
pub mod config;
pub mod domain;
pub mod error;
pub mod manager;
pub mod output;
pub mod parser;
pub mod pool;
pub mod schema;
pub mod store;
pub mod table;
pub mod translator;
