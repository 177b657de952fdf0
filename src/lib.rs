pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod datasets;
pub mod domain;
pub mod error;
pub mod error_report;
pub mod models;
pub mod output;
pub mod parse;
pub mod resolve;
pub mod submit;
pub mod table;
