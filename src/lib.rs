pub mod common;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod output;
pub mod raydium;
pub mod resolver;
pub mod stream;
