pub mod backends;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod generator;
pub mod model;
pub mod providers;
pub mod report;
pub mod storage;
