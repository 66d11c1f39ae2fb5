//! Flood Sentinel
//!
//! SYN and UDP flood detection over live captures and capture files, with
//! time-limited blocking of offending sources and a batch aggregator that
//! loads capture files into a record store.

pub mod api;
pub mod capture;
pub mod config;
pub mod core;
pub mod etl;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod utils;
