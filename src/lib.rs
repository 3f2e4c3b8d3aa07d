pub mod config;
pub mod db;
pub mod debounce;
pub mod model;
pub mod outbox;
pub mod parser;
pub mod pipeline;
pub mod retry;
pub mod transmit;
pub mod watcher;
