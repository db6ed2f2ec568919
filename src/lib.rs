#![forbid(unsafe_code)]

pub mod adapters;
pub mod cache;
pub mod config;
pub mod datasource;
pub mod eslike;
pub mod format;
pub mod mongo;
pub mod sql;
pub mod sync;
pub mod tdengine;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
