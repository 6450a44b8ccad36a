pub mod analyzers;
pub mod config;
pub mod dataset;
pub mod error;
pub mod inspect;
pub mod output;
