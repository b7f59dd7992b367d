#![forbid(unsafe_code)]

pub mod git;
pub mod lock;
pub mod naming;
pub mod process;
pub mod workspace;
