#![forbid(unsafe_code)]

pub mod execution;
pub mod model;
pub mod prompt;
pub mod provider;
pub mod scheduler;
pub mod storage;
pub mod worker;
