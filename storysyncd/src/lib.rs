pub mod cache;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod migration;
pub mod model;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod token_provider;
pub mod transfer;
