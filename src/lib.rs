pub mod app;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod fingerprint;
pub mod fs_util;
pub mod geo;
pub mod orchestrator;
pub mod output;
pub mod registry;
pub mod store;
pub mod transform;
