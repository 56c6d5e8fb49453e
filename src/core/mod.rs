pub mod batch;
pub mod config;
pub mod llm;
pub mod notify;
pub mod persist;
pub mod store;
pub mod terminal;
