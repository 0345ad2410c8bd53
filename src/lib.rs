pub mod backend;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod segmenter;
