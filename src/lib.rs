//! # RPL-ADMIN
//!
//! 单主多从复制拓扑管理系统
//!
//! ## 核心能力
//!
//! - **拓扑注册**: 连接主库/从库，基于主库公告的从库列表自动发现
//! - **健康检查**: IO/SQL 线程、延迟、日志位点、GTID 差异、过滤规则
//! - **候选选举**: 有序短路的资格检查流水线 (CONNECTED → GTID → BEHIND → FILTERS → BINLOG → RPL_USER)
//! - **计划切换**: 写屏蔽 → 等待追平 → 角色交换 → 从库重指向 (switchover)
//! - **故障转移**: 候选追平所有存活从库后提升 (failover)，以及持续监控守护进程
//! - **多源轮转**: 单个从库在多个主库之间按时间片轮转复制
//! - **一致性校验**: GTID 同步点 + 逐表校验和比对
//!
//! ## 架构设计
//!
//! ```text
//! 命令行 (rpl-admin / rpl_failover / rpl_ms / rpl_sync)
//!     ↓
//! Admin / Daemon / Scheduler / ConsistencyChecker
//!     ↓
//! FailoverEngine ← EligibilityChecker
//!     ↓
//! TopologyRegistry (health / errant / privileges / fan-out)
//!     ↓
//! PrimaryView / ReplicaView
//!     ↓
//! ServerConnection (驱动边界，内置 lab 模拟后端)
//! ```

#![allow(dead_code)]

// ============================================================================
// 外部依赖
// ============================================================================

// 异步运行时
pub use futures;
pub use tokio;

// 并发工具
pub use dashmap;
pub use parking_lot;

// 序列化
pub use serde;
pub use serde_json;

// 时间
pub use chrono;

// 日志
pub use log;

// 错误处理
pub use anyhow;
pub use thiserror;

// ============================================================================
// 内部模块
// ============================================================================

/// GTID 集合运算
pub mod gtid;

/// 服务器连接边界 (身份、连接串、语句、主/从视图)
pub mod server;

/// 复制协议辅助 (状态快照、CHANGE MASTER 构造、过滤规则、初始搭建)
pub mod replication;

/// 拓扑注册表
pub mod topology;

/// 候选资格、切换/故障转移状态机、外部脚本、监控守护
pub mod failover;

/// 多源轮转调度
pub mod multisource;

/// 数据一致性校验
pub mod sync;

/// 管理命令分发
pub mod admin;

/// 内存模拟后端
pub mod lab;

// 可观测性模块 (Prometheus)
pub mod observability;

/// 工具模块
pub mod utils;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use failover::{EligibilityChecker, EligibilityResult, FailoverEngine, FailoverState};
pub use gtid::GtidSet;
pub use server::{
    ConnectionSpec, Connector, Credentials, PrimaryView, ReplicaView, ServerConnection,
    ServerHandle, ServerIdentity, Statement,
};
pub use topology::{ReplicaRecord, TopologyRegistry};
pub use utils::config::RplConfig;

// ============================================================================
// 全局错误类型
// ============================================================================

/// 复制管理错误类型
#[derive(Debug, thiserror::Error)]
pub enum RplError {
    /// 无法连接服务器 (通常可视为该成员缺席)
    #[error("Connectivity error: {0}")]
    ConnectivityError(String),

    /// 前置条件不满足 (GTID 模式不一致、权限不足、过滤规则不一致、缺少复制用户)
    #[error("Prerequisite failed: {0}")]
    PrerequisiteError(String),

    /// 一致性问题 (游离事务、校验和不一致)
    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    /// 变更窗口内的步骤失败，无法自动回滚
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 有界等待超时
    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Invalid GTID set: {0}")]
    GtidError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl RplError {
    /// 是否可以降级为警告继续执行
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RplError::ConnectivityError(_) | RplError::TimeoutError(_)
        )
    }
}

impl From<std::io::Error> for RplError {
    fn from(e: std::io::Error) -> Self {
        RplError::IOError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RplError>;

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(RplError::ConnectivityError("down".into()).is_recoverable());
        assert!(RplError::TimeoutError("wait".into()).is_recoverable());
        assert!(!RplError::ProtocolError("change master".into()).is_recoverable());
        assert!(!RplError::PrerequisiteError("gtid".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = RplError::PrerequisiteError("GTID_MODE=ON required".to_string());
        assert_eq!(err.to_string(), "Prerequisite failed: GTID_MODE=ON required");
    }
}
