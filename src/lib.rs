pub mod billing;
pub mod config;
pub mod db;
pub mod events;
pub mod llm;
pub mod marketplace;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod scheduler;
