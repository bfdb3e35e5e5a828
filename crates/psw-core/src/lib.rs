#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod dataset;
pub mod image;
pub mod seed;
pub mod types;
