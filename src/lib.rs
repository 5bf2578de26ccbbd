pub mod aggregate;
pub mod calendar;
pub mod charts;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod output;
pub mod parser;
pub mod pipeline;
