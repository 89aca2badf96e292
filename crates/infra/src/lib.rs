//! Infrastructure layer: job store, broker, coordinator, executors, config.
//!
//! ## Components
//!
//! - [`store`]: durable job records (in-memory and Postgres)
//! - [`broker`]: at-least-once task delivery (in-memory and Redis Streams)
//! - [`coordinator`]: every state change of a job goes through here
//! - [`workers`]: worker pool, task handlers, reaper
//! - [`config`] / [`bootstrap`]: environment settings and wiring

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod retry;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;
