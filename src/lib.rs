pub mod account;
pub mod api;
pub mod config;
pub mod dashboard;
pub mod push;
pub mod reconciler;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod utils;
