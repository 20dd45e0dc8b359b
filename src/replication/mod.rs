//! 复制协议辅助
//!
//! - 状态快照: `MasterStatus` / `ReplicationStatusSnapshot`
//! - 重指向命令: `ChangeMasterCommand`
//! - 过滤规则: `ReplicaFilterRules` / `ReplicationFilterSet`
//! - 初始搭建: `ReplicationSetup` (多源轮转首轮使用)

pub mod command;
pub mod filters;
pub mod setup;
pub mod status;

pub use command::{ChangeMasterCommand, Positioning, SslOptions};
pub use filters::{binlog_filters_match, like_to_regex, ReplicaFilterRules, ReplicationFilterSet};
pub use setup::ReplicationSetup;
pub use status::{IoThreadState, MasterStatus, ReplicationStatusSnapshot, IO_STATE_WAITING};
