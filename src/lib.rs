pub mod cache;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod decider;
pub mod filewatcher;
pub mod filter;
pub mod handler;
pub mod key;
pub mod reconcile;
pub mod types;
pub mod worker;
pub mod workqueue;

#[cfg(test)]
pub(crate) mod testing;
