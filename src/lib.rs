//! # lanekeeper
//!
//! Postgres-backed coordination core for fleets of independent worker lanes.
//!
//! Each lane pulls work items from its own queue (pgmq), invokes an external
//! processor, records results through a sink, and checkpoints completion
//! exactly once. This crate provides the coordination layer around that loop:
//! checkpointing, a distributed token-bucket rate limiter, worker lifecycle
//! supervision, health monitoring with throttled auto-restart, and
//! exclusive-operation locking for administrative commands.

pub mod admin;
pub mod broker;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod external;
pub mod model;
pub mod monitor;
pub mod ratelimit;
pub mod supervisor;
pub mod telemetry;
pub mod worker;
