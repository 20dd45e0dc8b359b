//! 模拟连接

use super::LabCluster;
use crate::gtid::GtidSet;
use crate::replication::{MasterStatus, ReplicationStatusSnapshot};
use crate::server::{
    AdvertisedReplica, ConnectionSpec, Connector, ServerConnection, ServerHandle, ServerIdentity,
    Statement, UserAccount,
};
use crate::{Result, RplError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 等待类调用的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 到模拟服务器的连接
pub struct LabConnection {
    cluster: LabCluster,
    identity: ServerIdentity,
    account: UserAccount,
}

impl LabConnection {
    fn snapshot<R>(&self, f: impl FnOnce(&super::LabServer) -> R) -> Result<R> {
        self.cluster.pump();
        self.cluster.read(&self.identity, f)
    }

    /// 轮询直到条件满足或超时
    async fn poll_until(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&super::LabServer) -> bool,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.snapshot(&mut done)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ServerConnection for LabConnection {
    fn identity(&self) -> ServerIdentity {
        self.identity.clone()
    }

    async fn is_alive(&self) -> bool {
        self.snapshot(|_| ()).is_ok()
    }

    async fn reconnect(&self) -> Result<()> {
        self.snapshot(|_| ())
    }

    async fn variable(&self, name: &str) -> Result<Option<String>> {
        self.snapshot(|s| s.variable(name))
    }

    async fn execute(&self, statement: &Statement) -> Result<()> {
        if let Some(privilege) = required_privilege(statement) {
            let granted = self.snapshot(|s| {
                s.user(&self.account.user)
                    .map(|u| u.has_privilege(privilege))
                    .unwrap_or(false)
            })?;
            if !granted {
                return Err(RplError::ProtocolError(format!(
                    "Access denied for user '{}' on '{}'; you need the {} privilege for this operation",
                    self.account.user, self.identity, privilege
                )));
            }
        }
        self.cluster.execute(&self.identity, statement)
    }

    async fn master_status(&self) -> Result<Option<MasterStatus>> {
        self.snapshot(|s| s.master_status())
    }

    async fn replica_status(&self) -> Result<Option<ReplicationStatusSnapshot>> {
        self.snapshot(|s| s.replica_status())
    }

    async fn advertised_replicas(&self) -> Result<Vec<AdvertisedReplica>> {
        self.cluster.pump();
        self.cluster.read(&self.identity, |_| ())?;

        let mut advertised = Vec::new();
        for id in self.cluster.identities() {
            let Some(server) = self.cluster.server(&id) else {
                continue;
            };
            let registered = server.alive
                && server
                    .upstream
                    .as_ref()
                    .map(|u| u.identity.same_server(&self.identity))
                    .unwrap_or(false)
                && server.io_thread == crate::replication::IoThreadState::Running;
            if registered {
                advertised.push(AdvertisedReplica {
                    host: server
                        .report_host
                        .clone()
                        .unwrap_or_else(|| server.identity.host.clone()),
                    port: server.identity.port,
                    server_id: server.server_id,
                });
            }
        }
        Ok(advertised)
    }

    async fn current_user(&self) -> Result<UserAccount> {
        self.snapshot(|_| self.account.clone())
    }

    async fn user_privileges(&self, account: &UserAccount) -> Result<Vec<String>> {
        self.snapshot(|s| {
            s.user(&account.user)
                .map(|u| u.privileges.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn users_with_privilege(&self, privilege: &str) -> Result<Vec<UserAccount>> {
        self.snapshot(|s| {
            s.users
                .iter()
                .filter(|u| u.has_privilege(privilege))
                .map(|u| u.account.clone())
                .collect()
        })
    }

    async fn wait_for_gtid(&self, gtids: &GtidSet, timeout: Duration) -> Result<bool> {
        self.poll_until(timeout, |s| gtids.is_subset(&s.executed)).await
    }

    async fn wait_for_log_position(
        &self,
        file: &str,
        position: u64,
        timeout: Duration,
    ) -> Result<bool> {
        self.poll_until(timeout, |s| {
            let same_file = s
                .upstream
                .as_ref()
                .map(|u| u.log_file == file)
                .unwrap_or(false);
            same_file && s.exec_pos >= position
        })
        .await
    }

    async fn databases(&self) -> Result<Vec<String>> {
        self.snapshot(|s| s.tables.keys().cloned().collect())
    }

    async fn tables(&self, database: &str) -> Result<Vec<String>> {
        self.snapshot(|s| {
            s.tables
                .get(database)
                .map(|t| t.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn table_definition(&self, database: &str, table: &str) -> Result<Option<String>> {
        self.snapshot(|s| s.tables.get(database).and_then(|t| t.get(table)).cloned())
    }

    async fn table_checksum(&self, database: &str, table: &str) -> Result<Option<String>> {
        let writes = self.cluster.table_writes(database, table);
        self.snapshot(|s| s.table_checksum(database, table, &writes))
    }
}

/// 复制控制语句需要 SUPER
fn required_privilege(statement: &Statement) -> Option<&'static str> {
    match statement {
        Statement::ChangeMaster(_)
        | Statement::StartReplica
        | Statement::StopReplica
        | Statement::StartSqlThread
        | Statement::StopSqlThread
        | Statement::StartSqlThreadUntil(_)
        | Statement::ResetReplica
        | Statement::ResetReplicaAll => Some("SUPER"),
        _ => None,
    }
}

/// 模拟集群的连接器
#[derive(Clone)]
pub struct LabConnector {
    cluster: LabCluster,
}

impl LabConnector {
    pub fn new(cluster: LabCluster) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &LabCluster {
        &self.cluster
    }
}

#[async_trait]
impl Connector for LabConnector {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<ServerHandle> {
        let identity = spec.identity();
        let authenticated = self.cluster.read(&identity, |s| {
            s.authenticate(&spec.credentials.user, spec.credentials.password.as_deref())
        })?;
        if !authenticated {
            return Err(RplError::ConnectivityError(format!(
                "Access denied for user '{}' on '{}'",
                spec.credentials.user, identity
            )));
        }

        let identity = self
            .cluster
            .identities()
            .into_iter()
            .find(|id| id.same_server(&identity))
            .unwrap_or(identity);

        Ok(Arc::new(LabConnection {
            cluster: self.cluster.clone(),
            identity,
            account: crate::server::UserAccount::new(spec.credentials.user.clone(), "%"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::LabServer;
    use crate::server::Credentials;

    fn root_at(host: &str) -> ConnectionSpec {
        ConnectionSpec::new(Credentials::new("root", Some("root".into())), host, 3306)
    }

    #[tokio::test]
    async fn test_connect_and_wait_for_gtid() {
        let cluster = LabCluster::new();
        let a = cluster.add_server(LabServer::new("a", 3306, 1));
        let b = cluster.add_server(LabServer::new("b", 3306, 2));
        cluster
            .attach(&b, &a, &Credentials::new("rpl", Some("rpl".into())))
            .unwrap();
        let fresh = cluster.commit(&a, 2).unwrap();

        let connector = cluster.connector();
        let replica = connector.connect(&root_at("b")).await.unwrap();
        assert!(replica
            .wait_for_gtid(&fresh, Duration::from_millis(50))
            .await
            .unwrap());

        let primary = connector.connect(&root_at("a")).await.unwrap();
        let advertised = primary.advertised_replicas().await.unwrap();
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].host, "b");
    }

    #[tokio::test]
    async fn test_replication_control_requires_super() {
        let cluster = LabCluster::new();
        let a = cluster.add_server(LabServer::new("a", 3306, 1));
        let b = cluster.add_server(LabServer::new("b", 3306, 2));
        cluster
            .attach(&b, &a, &Credentials::new("rpl", Some("rpl".into())))
            .unwrap();
        cluster.update(&b, |s| {
            s.users.push(crate::lab::LabUser::new("app", "app", &["SELECT"]))
        });

        let spec = ConnectionSpec::new(Credentials::new("app", Some("app".into())), "b", 3306);
        let app = cluster.connector().connect(&spec).await.unwrap();
        let err = app.execute(&Statement::StopReplica).await.err().unwrap();
        assert!(matches!(err, RplError::ProtocolError(ref m) if m.contains("SUPER")));
        assert!(cluster.server(&b).unwrap().sql_running);

        let root = cluster.connector().connect(&root_at("b")).await.unwrap();
        root.execute(&Statement::StopReplica).await.unwrap();
        assert!(!cluster.server(&b).unwrap().sql_running);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_password() {
        let cluster = LabCluster::new();
        cluster.add_server(LabServer::new("a", 3306, 1));
        let spec = ConnectionSpec::new(Credentials::new("root", Some("nope".into())), "a", 3306);
        let err = cluster.connector().connect(&spec).await.err().unwrap();
        assert!(matches!(err, RplError::ConnectivityError(_)));
    }

    #[tokio::test]
    async fn test_dead_server_is_not_alive() {
        let cluster = LabCluster::new();
        let a = cluster.add_server(LabServer::new("a", 3306, 1));
        let handle = cluster.connector().connect(&root_at("a")).await.unwrap();
        assert!(handle.is_alive().await);

        cluster.set_alive(&a, false);
        assert!(!handle.is_alive().await);
        assert!(handle.reconnect().await.is_err());
        assert!(handle.variable("server_uuid").await.is_err());
    }
}
