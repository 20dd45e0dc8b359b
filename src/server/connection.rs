//! 驱动层能力接口

use super::{ConnectionSpec, ServerIdentity, Statement};
use crate::gtid::GtidSet;
use crate::replication::{MasterStatus, ReplicationStatusSnapshot};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 已连接的远端服务器
pub type ServerHandle = Arc<dyn ServerConnection>;

/// 账号 'user'@'host'
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserAccount {
    pub user: String,
    pub host: String,
}

impl UserAccount {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for UserAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'@'{}'", self.user, self.host)
    }
}

/// 主库公告的从库 (SHOW SLAVE HOSTS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedReplica {
    pub host: String,
    pub port: u16,
    pub server_id: u32,
}

/// 远端服务器能力
///
/// 所有方法都是一次远端往返；实现方不得缓存状态快照。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// 连接目标
    fn identity(&self) -> ServerIdentity;

    /// 存活探测
    async fn is_alive(&self) -> bool;

    /// 断线重连
    async fn reconnect(&self) -> Result<()>;

    /// 读取全局变量 (@@GLOBAL.name)，不存在时为 None
    async fn variable(&self, name: &str) -> Result<Option<String>>;

    /// 执行变更语句
    async fn execute(&self, statement: &Statement) -> Result<()>;

    /// SHOW MASTER STATUS，未开启 binlog 时为 None
    async fn master_status(&self) -> Result<Option<MasterStatus>>;

    /// SHOW SLAVE STATUS，未配置复制时为 None
    async fn replica_status(&self) -> Result<Option<ReplicationStatusSnapshot>>;

    /// SHOW SLAVE HOSTS
    async fn advertised_replicas(&self) -> Result<Vec<AdvertisedReplica>>;

    /// 当前登录账号
    async fn current_user(&self) -> Result<UserAccount>;

    /// 账号在 *.* 上的全局权限
    async fn user_privileges(&self, account: &UserAccount) -> Result<Vec<String>>;

    /// 拥有指定全局权限的账号
    async fn users_with_privilege(&self, privilege: &str) -> Result<Vec<UserAccount>>;

    /// WAIT_UNTIL_SQL_THREAD_AFTER_GTIDS，超时返回 false
    async fn wait_for_gtid(&self, gtids: &GtidSet, timeout: Duration) -> Result<bool>;

    /// MASTER_POS_WAIT，超时返回 false
    async fn wait_for_log_position(&self, file: &str, position: u64, timeout: Duration)
        -> Result<bool>;

    async fn databases(&self) -> Result<Vec<String>>;

    async fn tables(&self, database: &str) -> Result<Vec<String>>;

    /// SHOW CREATE TABLE 文本
    async fn table_definition(&self, database: &str, table: &str) -> Result<Option<String>>;

    /// CHECKSUM TABLE，返回可比较的摘要
    async fn table_checksum(&self, database: &str, table: &str) -> Result<Option<String>>;
}

/// 打开连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<ServerHandle>;
}
