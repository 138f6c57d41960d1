pub mod config;
pub mod error;
pub mod generator;
pub mod orchestrator;
pub mod processor;
pub mod ratelimit;
pub mod review;
pub mod scratch;
pub mod throttle;
pub mod tracker;
pub mod transcript;
