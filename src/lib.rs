pub mod accessor;
pub mod backfill;
pub mod calendar;
pub mod config;
pub mod error;
pub mod gaps;
pub mod indicator;
pub mod model;
pub mod provider;
pub mod service;
pub mod session;
pub mod signal;
pub mod storage;

#[cfg(test)]
mod testing;
