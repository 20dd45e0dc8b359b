//! 主/从能力视图
//!
//! 同一连接句柄按当前角色包装为 `PrimaryView` 或 `ReplicaView`。
//! 角色交换时注册表只替换包装的视图，句柄本身不变。

use super::{Credentials, ServerHandle, ServerIdentity, Statement, UserAccount};
use crate::gtid::GtidSet;
use crate::replication::{
    ChangeMasterCommand, MasterStatus, ReplicationStatusSnapshot, SslOptions,
};
use crate::{Result, RplError};
use std::time::Duration;

/// 复制权限名
pub const REPLICATION_PRIVILEGE: &str = "REPLICATION SLAVE";

/// 变量取值是否表示开启
fn is_on(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_uppercase()).as_deref(),
        Some("ON") | Some("1") | Some("YES") | Some("TRUE")
    )
}

async fn execute_logged(handle: &ServerHandle, statement: Statement) -> Result<()> {
    log::debug!("[{}] {}", handle.identity(), statement);
    handle.execute(&statement).await
}

/// GTID_MODE=ON
pub async fn gtid_enabled(handle: &ServerHandle) -> Result<bool> {
    let mode = handle.variable("gtid_mode").await?;
    Ok(mode.map(|m| m.eq_ignore_ascii_case("ON")).unwrap_or(false))
}

/// GTID_MODE 原始取值，不支持时为 "NO"
pub async fn gtid_mode(handle: &ServerHandle) -> Result<String> {
    Ok(handle
        .variable("gtid_mode")
        .await?
        .map(|m| m.to_ascii_uppercase())
        .unwrap_or_else(|| "NO".to_string()))
}

pub async fn binlog_enabled(handle: &ServerHandle) -> Result<bool> {
    Ok(is_on(handle.variable("log_bin").await?.as_deref()))
}

pub async fn gtid_executed(handle: &ServerHandle) -> Result<GtidSet> {
    match handle.variable("gtid_executed").await? {
        Some(text) => GtidSet::parse(&text),
        None => Ok(GtidSet::new()),
    }
}

pub async fn server_uuid(handle: &ServerHandle) -> Result<String> {
    handle
        .variable("server_uuid")
        .await?
        .ok_or_else(|| RplError::PrerequisiteError(format!("[{}] server_uuid unavailable", handle.identity())))
}

/// 主库能力视图
#[derive(Clone)]
pub struct PrimaryView {
    handle: ServerHandle,
}

impl PrimaryView {
    pub fn new(handle: ServerHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    pub fn identity(&self) -> ServerIdentity {
        self.handle.identity()
    }

    /// 同一句柄的从库视图 (降级时使用)
    pub fn as_replica(&self) -> ReplicaView {
        ReplicaView::new(self.handle.clone())
    }

    pub async fn is_alive(&self) -> bool {
        self.handle.is_alive().await
    }

    pub async fn status(&self) -> Result<Option<MasterStatus>> {
        self.handle.master_status().await
    }

    pub async fn binlog_enabled(&self) -> Result<bool> {
        binlog_enabled(&self.handle).await
    }

    pub async fn gtid_enabled(&self) -> Result<bool> {
        gtid_enabled(&self.handle).await
    }

    pub async fn gtid_executed(&self) -> Result<GtidSet> {
        gtid_executed(&self.handle).await
    }

    pub async fn uuid(&self) -> Result<String> {
        server_uuid(&self.handle).await
    }

    /// binlog 过滤规则 (do_db, ignore_db)，未开启 binlog 时为空
    pub async fn binlog_filters(&self) -> Result<(Vec<String>, Vec<String>)> {
        Ok(match self.status().await? {
            Some(status) => (status.binlog_do_db, status.binlog_ignore_db),
            None => (Vec::new(), Vec::new()),
        })
    }

    /// 拥有复制权限的账号
    pub async fn replication_users(&self) -> Result<Vec<UserAccount>> {
        self.handle.users_with_privilege(REPLICATION_PRIVILEGE).await
    }

    /// 指定用户名是否具备复制权限
    pub async fn has_replication_user(&self, user: &str) -> Result<bool> {
        Ok(self
            .replication_users()
            .await?
            .iter()
            .any(|account| account.user == user))
    }

    /// 创建复制账号，已存在则跳过
    pub async fn create_replication_user(&self, credentials: &Credentials) -> Result<()> {
        if self.has_replication_user(&credentials.user).await? {
            log::debug!(
                "[{}] Replication user '{}' already exists",
                self.identity(),
                credentials.user
            );
            return Ok(());
        }

        let account = UserAccount::new(credentials.user.clone(), "%");
        log::info!("[{}] Creating replication user {}", self.identity(), account);
        execute_logged(
            &self.handle,
            Statement::CreateUser {
                account: account.clone(),
                password: credentials.password_or_empty().to_string(),
            },
        )
        .await?;
        execute_logged(&self.handle, Statement::GrantReplication(account)).await
    }

    pub async fn advertised_replicas(&self) -> Result<Vec<super::AdvertisedReplica>> {
        self.handle.advertised_replicas().await
    }

    /// 写屏蔽：FLUSH TABLES WITH READ LOCK + READ_ONLY
    pub async fn fence_writes(&self) -> Result<()> {
        log::info!("[{}] Locking tables and setting read-only", self.identity());
        execute_logged(&self.handle, Statement::FlushTablesWithReadLock).await?;
        execute_logged(&self.handle, Statement::SetReadOnly(true)).await
    }

    /// 释放写屏蔽 (READ_ONLY 保持不变)
    pub async fn release_fence(&self) -> Result<()> {
        log::info!("[{}] Unlocking tables", self.identity());
        execute_logged(&self.handle, Statement::UnlockTables).await
    }

    pub async fn set_read_only(&self, on: bool) -> Result<()> {
        execute_logged(&self.handle, Statement::SetReadOnly(on)).await
    }

    pub async fn lock_table_read(&self, database: &str, table: &str) -> Result<()> {
        execute_logged(
            &self.handle,
            Statement::LockTablesRead(vec![(database.to_string(), table.to_string())]),
        )
        .await
    }

    pub async fn unlock_tables(&self) -> Result<()> {
        execute_logged(&self.handle, Statement::UnlockTables).await
    }
}

/// 从库能力视图
#[derive(Clone)]
pub struct ReplicaView {
    handle: ServerHandle,
}

impl ReplicaView {
    pub fn new(handle: ServerHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    pub fn identity(&self) -> ServerIdentity {
        self.handle.identity()
    }

    /// 同一句柄的主库视图 (提升时使用)
    pub fn as_primary(&self) -> PrimaryView {
        PrimaryView::new(self.handle.clone())
    }

    pub async fn is_alive(&self) -> bool {
        self.handle.is_alive().await
    }

    pub async fn status(&self) -> Result<Option<ReplicationStatusSnapshot>> {
        self.handle.replica_status().await
    }

    /// 复制状态，未配置复制视为前置条件失败
    pub async fn require_status(&self) -> Result<ReplicationStatusSnapshot> {
        self.status().await?.ok_or_else(|| {
            RplError::PrerequisiteError(format!(
                "Server '{}' is not acting as a slave.",
                self.identity()
            ))
        })
    }

    /// 上游是否为指定主库
    pub async fn is_configured_for(&self, primary: &ServerIdentity) -> Result<bool> {
        Ok(match self.status().await? {
            Some(status) => status.upstream().same_server(primary),
            None => false,
        })
    }

    pub async fn gtid_enabled(&self) -> Result<bool> {
        gtid_enabled(&self.handle).await
    }

    pub async fn binlog_enabled(&self) -> Result<bool> {
        binlog_enabled(&self.handle).await
    }

    pub async fn gtid_executed(&self) -> Result<GtidSet> {
        gtid_executed(&self.handle).await
    }

    /// 复制使用的账号 (来自 SHOW SLAVE STATUS)
    pub async fn replication_user(&self) -> Result<Option<Credentials>> {
        Ok(self
            .status()
            .await?
            .filter(|s| !s.master_user.is_empty())
            .map(|s| Credentials::new(s.master_user, s.master_password)))
    }

    pub async fn start(&self) -> Result<()> {
        execute_logged(&self.handle, Statement::StartReplica).await
    }

    pub async fn stop(&self) -> Result<()> {
        execute_logged(&self.handle, Statement::StopReplica).await
    }

    pub async fn start_sql_thread(&self) -> Result<()> {
        execute_logged(&self.handle, Statement::StartSqlThread).await
    }

    pub async fn stop_sql_thread(&self) -> Result<()> {
        execute_logged(&self.handle, Statement::StopSqlThread).await
    }

    /// 启动 SQL 线程，到达 GTID 集合后自动停止
    pub async fn start_sql_thread_until(&self, gtids: &GtidSet) -> Result<()> {
        execute_logged(&self.handle, Statement::StartSqlThreadUntil(gtids.clone())).await
    }

    pub async fn reset(&self) -> Result<()> {
        execute_logged(&self.handle, Statement::ResetReplica).await
    }

    /// 忘记上游 (STOP SLAVE + RESET SLAVE ALL)
    pub async fn reset_all(&self) -> Result<()> {
        execute_logged(&self.handle, Statement::StopReplica).await?;
        execute_logged(&self.handle, Statement::ResetReplicaAll).await
    }

    /// 重指向新主库 (不启动复制)
    pub async fn switch_to(
        &self,
        primary: &PrimaryView,
        credentials: &Credentials,
        ssl: &SslOptions,
        from_beginning: bool,
    ) -> Result<()> {
        let gtid_on = self.gtid_enabled().await?;
        let upstream_status = if gtid_on { None } else { primary.status().await? };
        let command = ChangeMasterCommand::for_upstream(
            &primary.identity(),
            credentials,
            ssl,
            gtid_on,
            from_beginning,
            upstream_status.as_ref(),
        );
        self.change_master(command).await
    }

    pub async fn change_master(&self, command: ChangeMasterCommand) -> Result<()> {
        let identity = self.identity();
        execute_logged(&self.handle, Statement::ChangeMaster(command))
            .await
            .map_err(|e| {
                RplError::ProtocolError(format!("Slave {} change master failed. {}", identity, e))
            })
    }

    pub async fn wait_for_gtid(&self, gtids: &GtidSet, timeout: Duration) -> Result<bool> {
        if gtids.is_empty() {
            return Ok(true);
        }
        self.handle.wait_for_gtid(gtids, timeout).await
    }

    pub async fn wait_for_position(&self, file: &str, position: u64, timeout: Duration) -> Result<bool> {
        self.handle.wait_for_log_position(file, position, timeout).await
    }

    /// 落后主库的事务数
    pub async fn transactions_behind(&self, primary_executed: &GtidSet) -> Result<u64> {
        let own = self.gtid_executed().await?;
        Ok(primary_executed.subtract(&own).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::MockServerConnection;
    use std::sync::Arc;

    fn mock(host: &str) -> MockServerConnection {
        let mut conn = MockServerConnection::new();
        let identity = ServerIdentity::new(host, 3306);
        conn.expect_identity().returning(move || identity.clone());
        conn
    }

    #[tokio::test]
    async fn test_variable_flags() {
        let mut conn = mock("db1");
        conn.expect_variable().returning(|name| {
            Ok(match name {
                "gtid_mode" => Some("on".to_string()),
                "log_bin" => Some("1".to_string()),
                _ => None,
            })
        });
        let view = PrimaryView::new(Arc::new(conn));
        assert!(view.gtid_enabled().await.unwrap());
        assert!(view.binlog_enabled().await.unwrap());
        assert!(view.gtid_executed().await.unwrap().is_empty());
        assert!(view.uuid().await.is_err());
    }

    #[tokio::test]
    async fn test_fence_issues_lock_then_read_only() {
        let mut conn = mock("db1");
        let mut seq = mockall::Sequence::new();
        conn.expect_execute()
            .withf(|s| *s == Statement::FlushTablesWithReadLock)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        conn.expect_execute()
            .withf(|s| *s == Statement::SetReadOnly(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        PrimaryView::new(Arc::new(conn)).fence_writes().await.unwrap();
    }

    #[tokio::test]
    async fn test_change_master_failure_is_protocol_error() {
        let mut conn = mock("r1");
        conn.expect_execute()
            .returning(|_| Err(RplError::ConnectivityError("gone".into())));
        let view = ReplicaView::new(Arc::new(conn));
        let err = view
            .change_master(ChangeMasterCommand::new(&ServerIdentity::new("db2", 3306)))
            .await
            .unwrap_err();
        assert!(matches!(err, RplError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_not_a_replica() {
        let mut conn = mock("db1");
        conn.expect_replica_status().returning(|| Ok(None));
        let view = ReplicaView::new(Arc::new(conn));
        assert!(!view
            .is_configured_for(&ServerIdentity::new("db0", 3306))
            .await
            .unwrap());
        assert!(matches!(
            view.require_status().await,
            Err(RplError::PrerequisiteError(_))
        ));
    }
}
