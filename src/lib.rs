pub mod config;
pub mod mapping;
pub mod utils;
