//! Irrigation hub: MQTT ingestion, in-memory device state, pump commands and
//! Postgres persistence for a fleet of irrigation controllers.

pub mod batching;
pub mod commands;
pub mod config;
pub mod db;
pub mod decode;
pub mod errors;
pub mod forward;
pub mod handlers;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod service;
pub mod store;
pub mod topics;
pub mod validate;

pub use errors::{Error, Result};
