//! 模拟集群
//!
//! 每次读取前调用 `pump` 推进复制，直到拓扑稳定。

use super::server::{LabServer, SourceState};
use super::LabConnector;
use crate::gtid::GtidSet;
use crate::replication::{ChangeMasterCommand, Positioning};
use crate::server::{Credentials, ServerIdentity, Statement};
use crate::{Result, RplError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 链式复制最多推进的轮数
const MAX_PUMP_ROUNDS: usize = 16;

#[derive(Default)]
struct ClusterInner {
    servers: DashMap<ServerIdentity, Arc<RwLock<LabServer>>>,

    /// (库, 表) -> 写过该表的事务
    table_writes: RwLock<BTreeMap<(String, String), GtidSet>>,
}

/// 模拟集群句柄，可廉价克隆
#[derive(Clone, Default)]
pub struct LabCluster {
    inner: Arc<ClusterInner>,
}

impl LabCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, server: LabServer) -> ServerIdentity {
        let identity = server.identity.clone();
        self.inner
            .servers
            .insert(identity.clone(), Arc::new(RwLock::new(server)));
        identity
    }

    pub fn identities(&self) -> Vec<ServerIdentity> {
        let mut ids: Vec<_> = self.inner.servers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// 按身份查找 (支持 localhost / 127.0.0.1 别名)
    fn entry(&self, identity: &ServerIdentity) -> Option<Arc<RwLock<LabServer>>> {
        if let Some(e) = self.inner.servers.get(identity) {
            return Some(e.value().clone());
        }
        self.inner
            .servers
            .iter()
            .find(|e| e.key().same_server(identity))
            .map(|e| e.value().clone())
    }

    pub fn contains(&self, identity: &ServerIdentity) -> bool {
        self.entry(identity).is_some()
    }

    /// 服务器状态快照
    pub fn server(&self, identity: &ServerIdentity) -> Option<LabServer> {
        self.pump();
        self.entry(identity).map(|s| s.read().clone())
    }

    /// 修改服务器状态
    pub fn update<R>(&self, identity: &ServerIdentity, f: impl FnOnce(&mut LabServer) -> R) -> Option<R> {
        let server = self.entry(identity)?;
        let result = f(&mut server.write());
        Some(result)
    }

    pub(crate) fn read<R>(&self, identity: &ServerIdentity, f: impl FnOnce(&LabServer) -> R) -> Result<R> {
        let server = self.entry(identity).ok_or_else(|| unknown(identity))?;
        let guard = server.read();
        if !guard.alive {
            return Err(lost(identity));
        }
        Ok(f(&guard))
    }

    pub fn set_alive(&self, identity: &ServerIdentity, alive: bool) {
        self.update(identity, |s| s.alive = alive);
        self.pump();
    }

    /// 在服务器上执行语句
    pub fn execute(&self, identity: &ServerIdentity, statement: &Statement) -> Result<()> {
        let server = self.entry(identity).ok_or_else(|| unknown(identity))?;
        {
            let mut guard = server.write();
            if !guard.alive {
                return Err(lost(identity));
            }
            guard.apply_statement(statement)?;
        }
        self.pump();
        Ok(())
    }

    /// 把 replica 接到 primary 下并启动复制
    pub fn attach(&self, replica: &ServerIdentity, primary: &ServerIdentity, credentials: &Credentials) -> Result<()> {
        let gtid_on = self.read(replica, |s| s.gtid_mode)?;
        let positioning = if gtid_on {
            Positioning::AutoPosition
        } else {
            Positioning::FromBeginning
        };
        let command = ChangeMasterCommand::new(primary)
            .with_credentials(credentials)
            .with_positioning(positioning);
        self.execute(replica, &Statement::StopReplica)?;
        self.execute(replica, &Statement::ChangeMaster(command))?;
        self.execute(replica, &Statement::StartReplica)
    }

    /// 在服务器上提交 count 个本地事务
    pub fn commit(&self, identity: &ServerIdentity, count: u64) -> Result<GtidSet> {
        let server = self.entry(identity).ok_or_else(|| unknown(identity))?;
        let fresh = {
            let mut guard = server.write();
            if !guard.alive {
                return Err(lost(identity));
            }
            guard.commit_local(count)?
        };
        self.pump();
        Ok(fresh)
    }

    /// 提交写入指定表的事务
    pub fn commit_to_table(&self, identity: &ServerIdentity, database: &str, table: &str, count: u64) -> Result<GtidSet> {
        let fresh = {
            let server = self.entry(identity).ok_or_else(|| unknown(identity))?;
            let mut guard = server.write();
            if !guard.alive {
                return Err(lost(identity));
            }
            guard.commit_local(count)?
        };
        {
            let mut writes = self.inner.table_writes.write();
            let entry = writes
                .entry((database.to_string(), table.to_string()))
                .or_default();
            *entry = entry.union(&fresh);
        }
        self.pump();
        Ok(fresh)
    }

    /// 所有服务器上建表
    pub fn create_table(&self, database: &str, table: &str, definition: &str) {
        for identity in self.identities() {
            self.create_table_on(&identity, database, table, definition);
        }
    }

    pub fn create_table_on(&self, identity: &ServerIdentity, database: &str, table: &str, definition: &str) {
        self.update(identity, |s| {
            s.tables
                .entry(database.to_string())
                .or_default()
                .insert(table.to_string(), definition.to_string());
        });
    }

    pub fn drop_table_on(&self, identity: &ServerIdentity, database: &str, table: &str) {
        self.update(identity, |s| {
            if let Some(tables) = s.tables.get_mut(database) {
                tables.remove(table);
                if tables.is_empty() {
                    s.tables.remove(database);
                }
            }
        });
    }

    pub(crate) fn table_writes(&self, database: &str, table: &str) -> GtidSet {
        self.inner
            .table_writes
            .read()
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// 推进复制直到稳定
    pub fn pump(&self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            if !self.pump_once() {
                break;
            }
        }
    }

    fn pump_once(&self) -> bool {
        let mut changed = false;

        for identity in self.identities() {
            let Some(server) = self.entry(&identity) else {
                continue;
            };
            let upstream = {
                let guard = server.read();
                if !guard.alive {
                    continue;
                }
                match &guard.upstream {
                    Some(u) => u.clone(),
                    None => continue,
                }
            };

            let source = self
                .entry(&upstream.identity)
                .filter(|_| !upstream.identity.same_server(&identity))
                .map(|s| {
                    let s = s.read();
                    SourceState {
                        uuid: s.uuid.clone(),
                        alive: s.alive,
                        auth_ok: s
                            .user(&upstream.user)
                            .map(|u| {
                                u.password == upstream.password.clone().unwrap_or_default()
                                    && u.has_privilege("REPLICATION SLAVE")
                            })
                            .unwrap_or(false),
                        executed: s.executed.clone(),
                        log_file: s.log_file.clone(),
                        log_position: s.log_position(),
                    }
                });

            let mut guard = server.write();
            changed |= guard.receive(source);
            changed |= guard.apply();
        }
        changed
    }

    pub fn connector(&self) -> LabConnector {
        LabConnector::new(self.clone())
    }
}

fn unknown(identity: &ServerIdentity) -> RplError {
    RplError::ConnectivityError(format!("Can't connect to MySQL server on '{}'", identity))
}

fn lost(identity: &ServerIdentity) -> RplError {
    RplError::ConnectivityError(format!("Lost connection to MySQL server at '{}'", identity))
}
