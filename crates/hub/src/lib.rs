//! Greenhouse hub: keeps an in-memory, continuously reconciled view of a
//! greenhouse backend's sensors and actuators, and serves it as JSON.

pub mod api;
pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod feed;
pub mod health;
pub mod scheduler;
pub mod state;
pub mod thresholds;
pub mod timestamp;
pub mod web;

#[cfg(test)]
mod testing;
