//! 内存模拟复制集群
//!
//! 实现 `ServerConnection` / `Connector`，供命令行 `--lab` 与测试使用：
//! - `LabServer`: 单台服务器的复制状态机
//! - `LabCluster`: 服务器集合与复制推进
//! - `LabTopologyFile`: TOML 拓扑描述

pub mod cluster;
pub mod connection;
pub mod file;
pub mod server;

pub use cluster::LabCluster;
pub use connection::{LabConnection, LabConnector};
pub use file::LabTopologyFile;
pub use server::{LabServer, LabUser, Upstream, ALL_PRIVILEGES};
