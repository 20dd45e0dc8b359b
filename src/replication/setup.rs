//! 从零搭建一对主从复制
//!
//! 多源轮转的首轮使用：校验 server_id / UUID / 引擎兼容性，
//! 创建复制账号，CHANGE MASTER 并启动，最后等待 IO 线程连上。

use crate::replication::SslOptions;
use crate::server::{Credentials, PrimaryView, ReplicaView};
use crate::{Result, RplError};
use std::time::Duration;

/// 搭建 replica -> primary
pub struct ReplicationSetup {
    primary: PrimaryView,
    replica: ReplicaView,
    ssl: SslOptions,
    pedantic: bool,
    poll_interval: Duration,
}

impl ReplicationSetup {
    pub fn new(primary: PrimaryView, replica: ReplicaView) -> Self {
        Self {
            primary,
            replica,
            ssl: SslOptions::default(),
            pedantic: false,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = ssl;
        self
    }

    /// 引擎差异从警告升级为错误
    pub fn with_pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn server_id(view_handle: &crate::server::ServerHandle) -> Result<u32> {
        let id = view_handle.variable("server_id").await?.unwrap_or_default();
        Ok(id.trim().parse::<u32>().unwrap_or(0))
    }

    /// server_id 非零且不同
    pub async fn check_server_ids(&self) -> Result<()> {
        let primary_id = Self::server_id(self.primary.handle()).await?;
        let replica_id = Self::server_id(self.replica.handle()).await?;

        if primary_id == 0 {
            return Err(RplError::PrerequisiteError("Master server_id is set to 0.".to_string()));
        }
        if replica_id == 0 {
            return Err(RplError::PrerequisiteError("Slave server_id is set to 0.".to_string()));
        }
        if primary_id == replica_id {
            return Err(RplError::PrerequisiteError(
                "The slave's server_id is the same as the master.".to_string(),
            ));
        }
        Ok(())
    }

    /// UUID 不同
    pub async fn check_server_uuids(&self) -> Result<()> {
        let primary_uuid = self.primary.handle().variable("server_uuid").await?;
        let replica_uuid = self.replica.handle().variable("server_uuid").await?;

        match (primary_uuid, replica_uuid) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(RplError::PrerequisiteError(
                "Master does not support UUIDs.".to_string(),
            )),
            (Some(_), None) => Err(RplError::PrerequisiteError(
                "Slave does not support UUIDs.".to_string(),
            )),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(&b) => Err(RplError::PrerequisiteError(
                "The slave's UUID is the same as the master.".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn compare_variable(&self, name: &str, message: &str) -> Result<Vec<String>> {
        let on_primary = self.primary.handle().variable(name).await?;
        let on_replica = self.replica.handle().variable(name).await?;
        if on_primary == on_replica {
            return Ok(Vec::new());
        }

        log::debug!(
            "[{}] {} = {:?}, [{}] {} = {:?}",
            self.primary.identity(),
            name,
            on_primary,
            self.replica.identity(),
            name,
            on_replica
        );
        if self.pedantic {
            return Err(RplError::PrerequisiteError(message.to_string()));
        }
        Ok(vec![format!("WARNING: {}", message)])
    }

    /// InnoDB 版本差异
    pub async fn check_innodb_compatibility(&self) -> Result<Vec<String>> {
        self.compare_variable(
            "innodb_version",
            "Innodb settings differ between master and slave.",
        )
        .await
    }

    /// 默认存储引擎差异
    pub async fn check_storage_engines(&self) -> Result<Vec<String>> {
        self.compare_variable(
            "default_storage_engine",
            "The master and slave have differing storage engine configurations!",
        )
        .await
    }

    /// 全部前置检查，返回警告
    pub async fn check_all(&self) -> Result<Vec<String>> {
        self.check_server_ids().await?;
        self.check_server_uuids().await?;

        let mut warnings = self.check_innodb_compatibility().await?;
        warnings.extend(self.check_storage_engines().await?);

        if !self.primary.binlog_enabled().await? {
            return Err(RplError::PrerequisiteError(format!(
                "Master must have binary logging turned on. ({})",
                self.primary.identity()
            )));
        }
        Ok(warnings)
    }

    /// 创建账号、重指向、启动并等待 IO 线程连上
    ///
    /// 返回 false 表示在 num_tries 次轮询内未连上
    pub async fn setup(&self, rpl_user: &Credentials, num_tries: u32) -> Result<bool> {
        self.primary.create_replication_user(rpl_user).await?;

        if self.primary.status().await?.is_none() {
            return Err(RplError::PrerequisiteError(
                "Cannot retrieve master status.".to_string(),
            ));
        }

        if let Some(status) = self.replica.status().await? {
            if status.io_running() || status.sql_running {
                self.replica.stop().await?;
            }
        }

        log::info!(
            "[{}] Connecting slave to master {}",
            self.replica.identity(),
            self.primary.identity()
        );
        self.replica
            .switch_to(&self.primary, rpl_user, &self.ssl, false)
            .await?;
        self.replica.start().await?;

        for attempt in 0..num_tries {
            if let Some(status) = self.replica.status().await? {
                if status.has_sql_error() && !status.sql_running {
                    log::warn!(
                        "[{}] SQL thread stopped: {}",
                        self.replica.identity(),
                        status.last_sql_error
                    );
                }
                if status.is_connected() {
                    return Ok(true);
                }
                log::debug!(
                    "[{}] IO status '{}' (attempt {}/{})",
                    self.replica.identity(),
                    status.io_state_text,
                    attempt + 1,
                    num_tries
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::{LabCluster, LabServer};
    use crate::server::{ConnectionSpec, Connector, ServerIdentity};

    async fn views(cluster: &LabCluster, primary: &str, replica: &str) -> (PrimaryView, ReplicaView) {
        let connector = cluster.connector();
        let root = Credentials::new("root", Some("root".into()));
        let p = connector
            .connect(&ConnectionSpec::new(root.clone(), primary, 3306))
            .await
            .unwrap();
        let r = connector
            .connect(&ConnectionSpec::new(root, replica, 3306))
            .await
            .unwrap();
        (PrimaryView::new(p), ReplicaView::new(r))
    }

    #[tokio::test]
    async fn test_setup_connects_replica() {
        let cluster = LabCluster::new();
        let primary = cluster.add_server(LabServer::new("m1", 3306, 1));
        cluster.add_server(LabServer::new("s1", 3306, 2));
        cluster.commit(&primary, 3).unwrap();

        let (p, r) = views(&cluster, "m1", "s1").await;
        let setup = ReplicationSetup::new(p, r.clone()).with_poll_interval(Duration::from_millis(5));
        assert!(setup.check_all().await.unwrap().is_empty());

        let rpl = Credentials::new("ms_rpl", Some("pw".into()));
        assert!(setup.setup(&rpl, 10).await.unwrap());
        let status = r.require_status().await.unwrap();
        assert_eq!(status.upstream(), ServerIdentity::new("m1", 3306));
        assert_eq!(status.master_user, "ms_rpl");
        assert!(status.auto_position);
    }

    #[tokio::test]
    async fn test_duplicate_server_id_rejected() {
        let cluster = LabCluster::new();
        cluster.add_server(LabServer::new("m1", 3306, 7));
        cluster.add_server(LabServer::new("s1", 3306, 7));

        let (p, r) = views(&cluster, "m1", "s1").await;
        let err = ReplicationSetup::new(p, r).check_server_ids().await.unwrap_err();
        assert!(err.to_string().contains("same as the master"));
    }

    #[tokio::test]
    async fn test_engine_difference_is_warning_unless_pedantic() {
        let cluster = LabCluster::new();
        cluster.add_server(LabServer::new("m1", 3306, 1));
        cluster.add_server(LabServer {
            default_storage_engine: "MyISAM".to_string(),
            ..LabServer::new("s1", 3306, 2)
        });

        let (p, r) = views(&cluster, "m1", "s1").await;
        let warnings = ReplicationSetup::new(p.clone(), r.clone())
            .check_storage_engines()
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);

        let strict = ReplicationSetup::new(p, r).with_pedantic(true);
        assert!(strict.check_storage_engines().await.is_err());
    }
}
