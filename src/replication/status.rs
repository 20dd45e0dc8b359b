//! 复制状态快照
//!
//! 每次查询整体替换，不缓存、不原地修改。

use super::filters::ReplicaFilterRules;
use super::SslOptions;
use crate::gtid::GtidSet;
use crate::server::ServerIdentity;
use serde::{Deserialize, Serialize};

/// 主库状态 (SHOW MASTER STATUS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStatus {
    pub log_file: String,
    pub log_position: u64,
    pub binlog_do_db: Vec<String>,
    pub binlog_ignore_db: Vec<String>,
    pub executed_gtid_set: GtidSet,
}

/// IO 线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoThreadState {
    Running,
    Connecting,
    Stopped,
}

impl IoThreadState {
    /// Slave_IO_Running 列取值
    pub fn as_str(&self) -> &'static str {
        match self {
            IoThreadState::Running => "Yes",
            IoThreadState::Connecting => "Connecting",
            IoThreadState::Stopped => "No",
        }
    }
}

/// 从库复制状态 (SHOW SLAVE STATUS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatusSnapshot {
    pub master_host: String,
    pub master_port: u16,
    pub master_user: String,
    pub master_password: Option<String>,

    /// 上游 server_uuid，未连上过时为空
    pub master_uuid: String,

    /// Slave_IO_State 文本，如 "Waiting for master to send event"
    pub io_state_text: String,
    pub io_thread: IoThreadState,
    pub sql_running: bool,

    /// 已读取的主库日志坐标
    pub master_log_file: String,
    pub read_master_log_pos: u64,

    /// 已执行的主库日志坐标
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,

    pub seconds_behind: Option<u64>,
    pub sql_delay: u64,
    pub sql_remaining_delay: Option<u64>,

    pub last_io_errno: u32,
    pub last_io_error: String,
    pub last_sql_errno: u32,
    pub last_sql_error: String,

    pub retrieved_gtid_set: GtidSet,
    pub executed_gtid_set: GtidSet,
    pub auto_position: bool,

    pub ssl: SslOptions,
    pub filters: ReplicaFilterRules,
}

/// 已连接上游的 IO 状态文本
pub const IO_STATE_WAITING: &str = "Waiting for master to send event";

impl ReplicationStatusSnapshot {
    /// 上游身份
    pub fn upstream(&self) -> ServerIdentity {
        ServerIdentity::new(self.master_host.clone(), self.master_port)
    }

    pub fn io_running(&self) -> bool {
        self.io_thread == IoThreadState::Running
    }

    /// IO 与 SQL 线程都在运行
    pub fn is_running(&self) -> bool {
        self.io_running() && self.sql_running
    }

    pub fn has_io_error(&self) -> bool {
        self.last_io_errno > 0
    }

    pub fn has_sql_error(&self) -> bool {
        self.last_sql_errno > 0 || !self.last_sql_error.is_empty()
    }

    /// 已连接上游并等待事件
    pub fn is_connected(&self) -> bool {
        self.io_running() && self.io_state_text == IO_STATE_WAITING
    }

    /// 已读取但尚未执行的事务
    pub fn pending_gtids(&self) -> GtidSet {
        self.retrieved_gtid_set.subtract(&self.executed_gtid_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ReplicationStatusSnapshot {
        ReplicationStatusSnapshot {
            master_host: "db1".into(),
            master_port: 3306,
            master_user: "rpl".into(),
            master_password: None,
            master_uuid: "3e11fa47-71ca-11e1-9e33-c80aa9429562".into(),
            io_state_text: IO_STATE_WAITING.into(),
            io_thread: IoThreadState::Running,
            sql_running: true,
            master_log_file: "mysql-bin.000001".into(),
            read_master_log_pos: 154,
            relay_master_log_file: "mysql-bin.000001".into(),
            exec_master_log_pos: 154,
            seconds_behind: Some(0),
            sql_delay: 0,
            sql_remaining_delay: None,
            last_io_errno: 0,
            last_io_error: String::new(),
            last_sql_errno: 0,
            last_sql_error: String::new(),
            retrieved_gtid_set: GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-9").unwrap(),
            executed_gtid_set: GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-6").unwrap(),
            auto_position: true,
            ssl: SslOptions::default(),
            filters: ReplicaFilterRules::default(),
        }
    }

    #[test]
    fn test_snapshot_helpers() {
        let s = snapshot();
        assert!(s.is_running());
        assert!(s.is_connected());
        assert_eq!(s.upstream(), ServerIdentity::new("db1", 3306));
        assert_eq!(s.pending_gtids().count(), 3);
        assert!(!s.has_io_error());

        let stopped = ReplicationStatusSnapshot {
            io_thread: IoThreadState::Connecting,
            ..s
        };
        assert!(!stopped.is_running());
        assert_eq!(stopped.io_thread.as_str(), "Connecting");
    }
}
