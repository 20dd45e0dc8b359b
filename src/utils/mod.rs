//! 工具模块

pub mod cli;
pub mod config;

pub use cli::CommonArgs;
pub use config::{FailoverMode, ReportValue, RplConfig};
