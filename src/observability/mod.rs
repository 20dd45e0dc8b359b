//! 可观测性模块
//!
//! Prometheus 指标，守护进程以 debug 级别输出

pub mod metrics;

pub use metrics::*;
