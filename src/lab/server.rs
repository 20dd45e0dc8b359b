//! 模拟服务器状态
//!
//! 事务统一以 GTID 记账；GTID_MODE=OFF 的服务器只是不对外报告 GTID。
//! binlog 位点由已执行事务数推导。

use crate::gtid::GtidSet;
use crate::replication::{
    IoThreadState, MasterStatus, Positioning, ReplicaFilterRules, ReplicationFilterSet,
    ReplicationStatusSnapshot, SslOptions, IO_STATE_WAITING,
};
use crate::server::{ServerIdentity, Statement, UserAccount};
use crate::{Result, RplError};
use std::collections::{BTreeMap, BTreeSet};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// "ALL PRIVILEGES" 展开后的权限
pub const ALL_PRIVILEGES: &[&str] = &[
    "SUPER",
    "GRANT OPTION",
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "CREATE",
    "DROP",
    "RELOAD",
    "PROCESS",
    "LOCK TABLES",
    "REPLICATION SLAVE",
    "REPLICATION CLIENT",
];

const BINLOG_HEADER_SIZE: u64 = 4;
const EVENT_SIZE: u64 = 100;

/// 模拟账号
#[derive(Debug, Clone)]
pub struct LabUser {
    pub account: UserAccount,
    pub password: String,
    pub privileges: BTreeSet<String>,
}

impl LabUser {
    pub fn new(user: &str, password: &str, privileges: &[&str]) -> Self {
        let privileges = privileges
            .iter()
            .flat_map(|p| {
                if p.eq_ignore_ascii_case("ALL") || p.eq_ignore_ascii_case("ALL PRIVILEGES") {
                    ALL_PRIVILEGES.iter().map(|s| s.to_string()).collect::<Vec<_>>()
                } else {
                    vec![p.to_ascii_uppercase()]
                }
            })
            .collect();
        Self {
            account: UserAccount::new(user, "%"),
            password: password.to_string(),
            privileges,
        }
    }

    pub fn has_privilege(&self, privilege: &str) -> bool {
        self.privileges.contains(&privilege.to_ascii_uppercase())
    }
}

/// 上游配置 (CHANGE MASTER 的结果)
#[derive(Debug, Clone)]
pub struct Upstream {
    pub identity: ServerIdentity,
    pub user: String,
    pub password: Option<String>,
    pub auto_position: bool,
    pub ssl: SslOptions,
    pub log_file: String,
    /// 连上后得知的上游 UUID
    pub uuid: Option<String>,
}

/// 上游在某一时刻的可见状态
#[derive(Debug, Clone)]
pub(crate) struct SourceState {
    pub uuid: String,
    pub alive: bool,
    pub auth_ok: bool,
    pub executed: GtidSet,
    pub log_file: String,
    pub log_position: u64,
}

/// 模拟服务器
#[derive(Debug, Clone)]
pub struct LabServer {
    pub identity: ServerIdentity,
    pub uuid: String,
    pub server_id: u32,
    pub version: String,
    pub alive: bool,

    pub gtid_mode: bool,
    pub log_bin: bool,
    pub read_only: bool,
    pub global_read_lock: bool,
    pub locked_tables: Vec<(String, String)>,

    pub log_file: String,
    pub binlog_do_db: Vec<String>,
    pub binlog_ignore_db: Vec<String>,

    pub executed: GtidSet,
    pub purged: GtidSet,

    pub upstream: Option<Upstream>,
    pub io_thread: IoThreadState,
    pub sql_running: bool,
    pub retrieved: GtidSet,
    pub sql_until: Option<GtidSet>,
    pub read_pos: u64,
    pub exec_pos: u64,
    pub io_error: Option<(u32, String)>,
    pub sql_error: Option<(u32, String)>,
    pub lag_seconds: u64,

    /// 到上游的连接卡住：IO 线程显示运行但收不到事件，重新 CHANGE MASTER 后恢复
    pub io_paused: bool,

    pub filters: ReplicaFilterRules,

    /// SHOW SLAVE HOSTS 中公告的主机名
    pub report_host: Option<String>,

    pub users: Vec<LabUser>,

    /// 库 -> 表 -> 建表语句
    pub tables: BTreeMap<String, BTreeMap<String, String>>,

    /// 人为的数据漂移，参与校验和
    pub drift: BTreeMap<(String, String), String>,

    pub master_info_repository: String,
    pub innodb_version: String,
    pub default_storage_engine: String,
}

impl LabServer {
    pub fn new(host: &str, port: u16, server_id: u32) -> Self {
        Self {
            identity: ServerIdentity::new(host, port),
            uuid: uuid::Uuid::new_v4().hyphenated().to_string(),
            server_id,
            version: "5.7.30-log".to_string(),
            alive: true,
            gtid_mode: true,
            log_bin: true,
            read_only: false,
            global_read_lock: false,
            locked_tables: Vec::new(),
            log_file: "mysql-bin.000001".to_string(),
            binlog_do_db: Vec::new(),
            binlog_ignore_db: Vec::new(),
            executed: GtidSet::new(),
            purged: GtidSet::new(),
            upstream: None,
            io_thread: IoThreadState::Stopped,
            sql_running: false,
            retrieved: GtidSet::new(),
            sql_until: None,
            read_pos: BINLOG_HEADER_SIZE,
            exec_pos: BINLOG_HEADER_SIZE,
            io_error: None,
            sql_error: None,
            lag_seconds: 0,
            io_paused: false,
            filters: ReplicaFilterRules::default(),
            report_host: None,
            users: vec![
                LabUser::new("root", "root", &["ALL"]),
                LabUser::new("rpl", "rpl", &["REPLICATION SLAVE"]),
            ],
            tables: BTreeMap::new(),
            drift: BTreeMap::new(),
            master_info_repository: "TABLE".to_string(),
            innodb_version: "5.7.30".to_string(),
            default_storage_engine: "InnoDB".to_string(),
        }
    }

    /// 当前 binlog 位点
    pub fn log_position(&self) -> u64 {
        if self.log_bin {
            BINLOG_HEADER_SIZE + EVENT_SIZE * self.executed.count()
        } else {
            0
        }
    }

    pub fn user(&self, name: &str) -> Option<&LabUser> {
        self.users.iter().find(|u| u.account.user == name)
    }

    pub fn authenticate(&self, user: &str, password: Option<&str>) -> bool {
        self.user(user)
            .map(|u| u.password == password.unwrap_or(""))
            .unwrap_or(false)
    }

    fn replication_running(&self) -> bool {
        self.io_thread != IoThreadState::Stopped || self.sql_running
    }

    fn require_stopped(&self) -> Result<()> {
        if self.replication_running() {
            return Err(RplError::ProtocolError(
                "This operation cannot be performed with a running slave; run STOP SLAVE first"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn require_upstream(&self) -> Result<()> {
        if self.upstream.is_none() {
            return Err(RplError::ProtocolError(
                "The server is not configured as slave; fix in config file or with CHANGE MASTER TO"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// 本地提交 count 个事务
    pub fn commit_local(&mut self, count: u64) -> Result<GtidSet> {
        if self.global_read_lock {
            return Err(RplError::ProtocolError(
                "Can't execute the query because you have a conflicting read lock".to_string(),
            ));
        }
        if self.read_only {
            return Err(RplError::ProtocolError(
                "The MySQL server is running with the --read-only option".to_string(),
            ));
        }
        if count == 0 {
            return Ok(GtidSet::new());
        }
        let next = self.executed.last_transaction(&self.uuid).unwrap_or(0) + 1;
        let fresh = GtidSet::from_range(&self.uuid, next, next + count - 1)?;
        self.executed = self.executed.union(&fresh);
        Ok(fresh)
    }

    /// 执行变更语句
    pub fn apply_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::ChangeMaster(cmd) => {
                self.require_stopped()?;
                let auto_position = cmd.positioning == Positioning::AutoPosition;
                if auto_position && !self.gtid_mode {
                    return Err(RplError::ProtocolError(
                        "CHANGE MASTER TO MASTER_AUTO_POSITION = 1 can only be executed when GTID_MODE = ON"
                            .to_string(),
                    ));
                }
                let previous = self.upstream.take();
                let (log_file, log_pos) = match &cmd.positioning {
                    Positioning::LogCoordinates { file, position } => {
                        (file.clone(), position.unwrap_or(BINLOG_HEADER_SIZE))
                    }
                    _ => ("mysql-bin.000001".to_string(), BINLOG_HEADER_SIZE),
                };
                self.upstream = Some(Upstream {
                    identity: cmd.upstream(),
                    user: cmd
                        .user
                        .clone()
                        .or_else(|| previous.as_ref().map(|p| p.user.clone()))
                        .unwrap_or_default(),
                    password: cmd
                        .password
                        .clone()
                        .or_else(|| previous.as_ref().and_then(|p| p.password.clone())),
                    auto_position,
                    ssl: cmd.ssl.clone(),
                    log_file,
                    uuid: None,
                });
                self.retrieved = GtidSet::new();
                self.read_pos = log_pos;
                self.exec_pos = log_pos;
                self.io_error = None;
                self.io_paused = false;
            }
            Statement::StartReplica => {
                self.require_upstream()?;
                if self.io_thread == IoThreadState::Stopped {
                    self.io_thread = IoThreadState::Connecting;
                }
                self.sql_running = true;
                self.sql_until = None;
                self.sql_error = None;
            }
            Statement::StopReplica => {
                self.io_thread = IoThreadState::Stopped;
                self.sql_running = false;
                self.sql_until = None;
            }
            Statement::StartSqlThread => {
                self.require_upstream()?;
                self.sql_running = true;
                self.sql_until = None;
                self.sql_error = None;
            }
            Statement::StartSqlThreadUntil(gtids) => {
                self.require_upstream()?;
                if !self.gtid_mode {
                    return Err(RplError::ProtocolError(
                        "SQL_AFTER_GTIDS requires GTID_MODE = ON".to_string(),
                    ));
                }
                self.sql_running = true;
                self.sql_until = Some(gtids.clone());
                self.sql_error = None;
            }
            Statement::StopSqlThread => {
                self.sql_running = false;
                self.sql_until = None;
            }
            Statement::ResetReplica => {
                self.require_stopped()?;
                self.retrieved = GtidSet::new();
                self.read_pos = BINLOG_HEADER_SIZE;
                self.exec_pos = BINLOG_HEADER_SIZE;
                self.io_error = None;
                self.sql_error = None;
            }
            Statement::ResetReplicaAll => {
                self.require_stopped()?;
                self.upstream = None;
                self.retrieved = GtidSet::new();
                self.read_pos = BINLOG_HEADER_SIZE;
                self.exec_pos = BINLOG_HEADER_SIZE;
                self.io_error = None;
                self.sql_error = None;
            }
            Statement::FlushTablesWithReadLock => self.global_read_lock = true,
            Statement::LockTablesRead(tables) => self.locked_tables = tables.clone(),
            Statement::UnlockTables => {
                self.global_read_lock = false;
                self.locked_tables.clear();
            }
            Statement::SetReadOnly(on) => self.read_only = *on,
            Statement::CreateUser { account, password } => {
                if self.user(&account.user).is_some() {
                    return Err(RplError::ProtocolError(format!(
                        "Operation CREATE USER failed for {}",
                        account
                    )));
                }
                let mut user = LabUser::new(&account.user, password, &[]);
                user.account = account.clone();
                self.users.push(user);
            }
            Statement::GrantReplication(account) => {
                let user = self
                    .users
                    .iter_mut()
                    .find(|u| u.account.user == account.user)
                    .ok_or_else(|| {
                        RplError::ProtocolError(format!(
                            "You are not allowed to create a user with GRANT ({})",
                            account
                        ))
                    })?;
                user.privileges.insert("REPLICATION SLAVE".to_string());
            }
        }
        Ok(())
    }

    /// IO 线程从上游拉取事件
    pub(crate) fn receive(&mut self, source: Option<SourceState>) -> bool {
        if self.io_thread == IoThreadState::Stopped {
            return false;
        }
        let upstream = match &self.upstream {
            Some(u) => u.clone(),
            None => return false,
        };
        let mut changed = false;

        match source {
            Some(src) if src.alive && src.auth_ok => {
                if self.io_thread != IoThreadState::Running || self.io_error.is_some() {
                    self.io_thread = IoThreadState::Running;
                    self.io_error = None;
                    changed = true;
                }
                if self.io_paused {
                    return changed;
                }
                let fresh = src
                    .executed
                    .subtract(&self.executed)
                    .subtract(&self.retrieved);
                if !fresh.is_empty() {
                    self.retrieved = self.retrieved.union(&fresh);
                    changed = true;
                }
                if self.read_pos != src.log_position {
                    self.read_pos = src.log_position;
                    changed = true;
                }
                if let Some(u) = self.upstream.as_mut() {
                    u.log_file = src.log_file;
                    u.uuid = Some(src.uuid);
                }
            }
            Some(src) if src.alive => {
                let error = (
                    1045,
                    format!(
                        "error connecting to master '{}@{}' - Access denied for user '{}'",
                        upstream.user, upstream.identity, upstream.user
                    ),
                );
                changed |= self.set_io_failure(error);
            }
            _ => {
                let error = (
                    2003,
                    format!(
                        "error connecting to master '{}@{}' - retry-time: 60  retries: 1",
                        upstream.user, upstream.identity
                    ),
                );
                changed |= self.set_io_failure(error);
            }
        }
        changed
    }

    fn set_io_failure(&mut self, error: (u32, String)) -> bool {
        if self.io_thread == IoThreadState::Connecting && self.io_error.as_ref() == Some(&error) {
            return false;
        }
        self.io_thread = IoThreadState::Connecting;
        self.io_error = Some(error);
        true
    }

    /// SQL 线程执行已拉取的事件
    pub(crate) fn apply(&mut self) -> bool {
        if !self.sql_running {
            return false;
        }
        let mut changed = false;

        let mut pending = self.retrieved.subtract(&self.executed);
        if let Some(until) = &self.sql_until {
            pending = pending.intersection(until);
        }
        if !pending.is_empty() {
            self.executed = self.executed.union(&pending);
            changed = true;
        }
        if self.retrieved.is_subset(&self.executed) && self.exec_pos != self.read_pos {
            self.exec_pos = self.read_pos;
            changed = true;
        }
        let reached = self
            .sql_until
            .as_ref()
            .map(|until| until.is_subset(&self.executed))
            .unwrap_or(false);
        if reached {
            self.sql_running = false;
            self.sql_until = None;
            changed = true;
        }
        changed
    }

    pub fn master_status(&self) -> Option<MasterStatus> {
        if !self.log_bin {
            return None;
        }
        Some(MasterStatus {
            log_file: self.log_file.clone(),
            log_position: self.log_position(),
            binlog_do_db: self.binlog_do_db.clone(),
            binlog_ignore_db: self.binlog_ignore_db.clone(),
            executed_gtid_set: self.reported(&self.executed),
        })
    }

    pub fn replica_status(&self) -> Option<ReplicationStatusSnapshot> {
        let upstream = self.upstream.as_ref()?;
        let io_state_text = match self.io_thread {
            IoThreadState::Running => IO_STATE_WAITING.to_string(),
            IoThreadState::Connecting => "Connecting to master".to_string(),
            IoThreadState::Stopped => String::new(),
        };
        let (io_errno, io_error) = self.io_error.clone().unwrap_or((0, String::new()));
        let (sql_errno, sql_error) = self.sql_error.clone().unwrap_or((0, String::new()));

        Some(ReplicationStatusSnapshot {
            master_host: upstream.identity.host.clone(),
            master_port: upstream.identity.port,
            master_user: upstream.user.clone(),
            master_password: upstream.password.clone(),
            master_uuid: upstream.uuid.clone().unwrap_or_default(),
            io_state_text,
            io_thread: self.io_thread,
            sql_running: self.sql_running,
            master_log_file: upstream.log_file.clone(),
            read_master_log_pos: self.read_pos,
            relay_master_log_file: upstream.log_file.clone(),
            exec_master_log_pos: self.exec_pos,
            seconds_behind: if self.sql_running { Some(self.lag_seconds) } else { None },
            sql_delay: 0,
            sql_remaining_delay: None,
            last_io_errno: io_errno,
            last_io_error: io_error,
            last_sql_errno: sql_errno,
            last_sql_error: sql_error,
            retrieved_gtid_set: self.reported(&self.retrieved),
            executed_gtid_set: self.reported(&self.executed),
            auto_position: upstream.auto_position,
            ssl: upstream.ssl.clone(),
            filters: self.filters.clone(),
        })
    }

    /// GTID_MODE=OFF 时不对外报告 GTID
    fn reported(&self, gtids: &GtidSet) -> GtidSet {
        if self.gtid_mode {
            gtids.clone()
        } else {
            GtidSet::new()
        }
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        let on_off = |b: bool| if b { "ON" } else { "OFF" }.to_string();
        Some(match name.to_ascii_lowercase().as_str() {
            "server_uuid" => self.uuid.clone(),
            "server_id" => self.server_id.to_string(),
            "version" => self.version.clone(),
            "hostname" => self.identity.host.clone(),
            "port" => self.identity.port.to_string(),
            "gtid_mode" => on_off(self.gtid_mode),
            "log_bin" => on_off(self.log_bin),
            "read_only" => on_off(self.read_only),
            "gtid_executed" => self.reported(&self.executed).to_string(),
            "gtid_purged" => self.reported(&self.purged).to_string(),
            "gtid_owned" => String::new(),
            "master_info_repository" => self.master_info_repository.clone(),
            "innodb_version" => self.innodb_version.clone(),
            "default_storage_engine" => self.default_storage_engine.clone(),
            "report_host" => self.report_host.clone()?,
            _ => return None,
        })
    }

    /// 表数据摘要：参与该表写入且已执行的事务 + 漂移
    pub(crate) fn table_checksum(&self, database: &str, table: &str, writes: &GtidSet) -> Option<String> {
        self.tables.get(database)?.get(table)?;

        let filtered = ReplicationFilterSet::compile(self.filters.clone())
            .map(|f| f.is_table_filtered(database, table))
            .unwrap_or(false);
        let visible = if filtered {
            writes.only_uuid(&self.uuid).intersection(&self.executed)
        } else {
            writes.intersection(&self.executed)
        };

        let mut hasher = DefaultHasher::new();
        database.hash(&mut hasher);
        table.hash(&mut hasher);
        visible.to_string().hash(&mut hasher);
        if let Some(drift) = self.drift.get(&(database.to_string(), table.to_string())) {
            drift.hash(&mut hasher);
        }
        Some(format!("{:016x}", hasher.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ChangeMasterCommand;
    use crate::server::Credentials;

    fn change_master(to: &LabServer) -> Statement {
        Statement::ChangeMaster(
            ChangeMasterCommand::new(&to.identity)
                .with_credentials(&Credentials::new("rpl", Some("rpl".into())))
                .with_positioning(Positioning::AutoPosition),
        )
    }

    fn source(of: &LabServer) -> SourceState {
        SourceState {
            uuid: of.uuid.clone(),
            alive: of.alive,
            auth_ok: true,
            executed: of.executed.clone(),
            log_file: of.log_file.clone(),
            log_position: of.log_position(),
        }
    }

    #[test]
    fn test_receive_and_apply() {
        let mut primary = LabServer::new("db1", 3306, 1);
        primary.commit_local(3).unwrap();

        let mut replica = LabServer::new("db2", 3306, 2);
        replica.apply_statement(&change_master(&primary)).unwrap();
        replica.apply_statement(&Statement::StartReplica).unwrap();

        assert!(replica.receive(Some(source(&primary))));
        assert!(replica.apply());
        assert_eq!(replica.executed, primary.executed);
        assert_eq!(replica.io_thread, IoThreadState::Running);
        assert!(replica.replica_status().unwrap().is_connected());
    }

    #[test]
    fn test_change_master_requires_stopped_replica() {
        let primary = LabServer::new("db1", 3306, 1);
        let mut replica = LabServer::new("db2", 3306, 2);
        replica.apply_statement(&change_master(&primary)).unwrap();
        replica.apply_statement(&Statement::StartReplica).unwrap();
        assert!(replica.apply_statement(&change_master(&primary)).is_err());
        assert!(replica.apply_statement(&Statement::ResetReplicaAll).is_err());

        replica.apply_statement(&Statement::StopReplica).unwrap();
        replica.apply_statement(&Statement::ResetReplicaAll).unwrap();
        assert!(replica.replica_status().is_none());
    }

    #[test]
    fn test_sql_until_stops_thread() {
        let mut primary = LabServer::new("db1", 3306, 1);
        primary.commit_local(10).unwrap();

        let mut replica = LabServer::new("db2", 3306, 2);
        replica.apply_statement(&change_master(&primary)).unwrap();
        replica.apply_statement(&Statement::StartReplica).unwrap();
        replica.apply_statement(&Statement::StopSqlThread).unwrap();
        replica.receive(Some(source(&primary)));

        let until = GtidSet::from_range(&primary.uuid, 1, 4).unwrap();
        replica
            .apply_statement(&Statement::StartSqlThreadUntil(until))
            .unwrap();
        replica.apply();
        assert_eq!(replica.executed.count(), 4);
        assert!(!replica.sql_running);
    }

    #[test]
    fn test_dead_upstream_reports_io_error() {
        let mut primary = LabServer::new("db1", 3306, 1);
        let mut replica = LabServer::new("db2", 3306, 2);
        replica.apply_statement(&change_master(&primary)).unwrap();
        replica.apply_statement(&Statement::StartReplica).unwrap();
        primary.alive = false;

        replica.receive(Some(source(&primary)));
        let status = replica.replica_status().unwrap();
        assert_eq!(status.io_thread, IoThreadState::Connecting);
        assert_eq!(status.last_io_errno, 2003);
        assert!(!replica.receive(Some(source(&primary))));
    }

    #[test]
    fn test_fenced_server_rejects_commits() {
        let mut server = LabServer::new("db1", 3306, 1);
        server.apply_statement(&Statement::FlushTablesWithReadLock).unwrap();
        assert!(server.commit_local(1).is_err());
        server.apply_statement(&Statement::UnlockTables).unwrap();
        assert!(server.commit_local(1).is_ok());
        server.apply_statement(&Statement::SetReadOnly(true)).unwrap();
        assert!(server.commit_local(1).is_err());
    }

    #[test]
    fn test_gtid_off_hides_sets() {
        let mut server = LabServer::new("db1", 3306, 1);
        server.gtid_mode = false;
        server.commit_local(2).unwrap();
        assert_eq!(server.variable("gtid_executed").as_deref(), Some(""));
        assert_eq!(server.master_status().unwrap().log_position, 204);
    }
}
