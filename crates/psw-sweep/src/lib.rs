#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Poisoning sweeps: experiment configuration, the per-percentage sweep
//! controller, and the multi-experiment driver.

pub mod config;
pub mod controller;
pub mod driver;
