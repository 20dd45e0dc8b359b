//! 数据一致性校验
//!
//! 以主库 (没有主库时为第一个从库) 为基准，逐库逐表比对结构与校验和。
//!
//! 同步点：
//! - 有主库：对目标表加读锁，取主库自身 UUID 的最后一个 GTID
//! - 无主库：先停所有活跃从库的 SQL 线程，取各自已执行集合的并集
//!
//! 活跃从库在 `START SLAVE SQL_THREAD UNTIL SQL_AFTER_GTIDS` 停下后再算校验和，
//! 随后恢复 SQL 线程；已停止的从库直接计算。

pub mod objects;
pub mod report;

pub use objects::{parse_version, ObjectSelection, MIN_SYNC_VERSION};
pub use report::{SyncFinding, SyncReport};

use crate::gtid::GtidSet;
use crate::observability::SYNC_ISSUES_TOTAL;
use crate::replication::ReplicationFilterSet;
use crate::server::view::{gtid_enabled, server_uuid};
use crate::server::{PrimaryView, ReplicaView, ServerHandle, ServerIdentity};
use crate::topology::privileges::missing_privileges;
use crate::topology::{fan_out, partition_results, PrivilegeFinding, TopologyRegistry};
use crate::utils::config::RplConfig;
use crate::{Result, RplError};
use objects::normalize_definition;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// 追平同步点超时的跳过原因
pub const CATCH_UP_TIMEOUT: &str = "timeout catching up with master";

/// 主库：读取状态 (SUPER 或 REPLICATION CLIENT 其一)、加读锁、读表
const PRIMARY_SYNC_PRIVILEGES: [&str; 4] = ["SUPER", "REPLICATION CLIENT", "LOCK TABLES", "SELECT"];

/// 从库：启停 SQL 线程、读表
const REPLICA_SYNC_PRIVILEGES: [&str; 2] = ["SUPER", "SELECT"];

/// 校验参数
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// 等待从库到达同步点的上限
    pub rpl_timeout: Duration,
    /// 单表校验和上限
    pub checksum_timeout: Duration,
    /// 轮询间隔
    pub sync_interval: Duration,
    pub selection: ObjectSelection,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            rpl_timeout: Duration::from_secs(300),
            checksum_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_secs(3),
            selection: ObjectSelection::default(),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &RplConfig) -> Result<Self> {
        Ok(Self {
            rpl_timeout: Duration::from_secs(config.rpl_timeout),
            checksum_timeout: Duration::from_secs(config.checksum_timeout),
            sync_interval: Duration::from_secs(config.sync_interval),
            selection: ObjectSelection::new(&config.include, &config.exclude)?,
        })
    }
}

/// 一致性校验器
pub struct ConsistencyChecker {
    options: SyncOptions,
    primary: Option<PrimaryView>,
    replicas: Vec<(ServerIdentity, ReplicaView)>,
    base: ServerIdentity,
    primary_filters: Option<ReplicationFilterSet>,
    replica_filters: HashMap<ServerIdentity, ReplicationFilterSet>,
    warnings: Vec<String>,
}

/// 一张待比对的表及参与比对的从库
struct TableTask {
    database: String,
    table: String,
    servers: Vec<ServerIdentity>,
}

impl ConsistencyChecker {
    /// 读取成员与过滤规则 (本次运行内只读一次)
    pub async fn new(registry: &TopologyRegistry, options: SyncOptions) -> Result<Self> {
        let primary = registry.primary().map(|p| p.view.clone());
        let replicas = registry.live_replicas().await;

        let base = match (&primary, replicas.first()) {
            (Some(p), _) => p.identity(),
            (None, Some((identity, _))) => identity.clone(),
            (None, None) => {
                return Err(RplError::InvalidParameter(
                    "At least one server is required to check data consistency.".to_string(),
                ))
            }
        };

        let primary_filters = match &primary {
            Some(p) => {
                let (do_db, ignore_db) = p.binlog_filters().await?;
                Some(ReplicationFilterSet::for_primary(do_db, ignore_db))
            }
            None => None,
        };

        let mut replica_filters = HashMap::new();
        for (identity, view) in &replicas {
            let rules = view.status().await?.map(|s| s.filters).unwrap_or_default();
            replica_filters.insert(
                identity.clone(),
                ReplicationFilterSet::for_replica(identity, rules)?,
            );
        }

        let mut warnings = Vec::new();
        let filtered = primary_filters.as_ref().map(|f| !f.is_empty()).unwrap_or(false)
            || replica_filters.values().any(|f| !f.is_empty());
        if filtered {
            let msg = "Replication filters found on checked servers. This can lead data \
                       consistency issues depending on how statements are evaluated."
                .to_string();
            log::warn!("{}", msg);
            warnings.push(msg);
        }

        Ok(Self {
            options,
            primary,
            replicas,
            base,
            primary_filters,
            replica_filters,
            warnings,
        })
    }

    pub fn base(&self) -> &ServerIdentity {
        &self.base
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn base_handle(&self) -> Result<ServerHandle> {
        if let Some(p) = &self.primary {
            return Ok(p.handle().clone());
        }
        self.replica_view(&self.base)
            .map(|v| v.handle().clone())
            .ok_or_else(|| RplError::ConnectivityError(format!("Base server {} not available", self.base)))
    }

    fn replica_view(&self, identity: &ServerIdentity) -> Option<&ReplicaView> {
        self.replicas
            .iter()
            .find(|(id, _)| id == identity)
            .map(|(_, view)| view)
    }

    /// 除基准服务器之外的从库
    fn others(&self) -> Vec<ServerIdentity> {
        self.replicas
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| *id != self.base)
            .collect()
    }

    fn is_database_filtered(&self, db: &str, server: Option<&ServerIdentity>) -> bool {
        if self
            .primary_filters
            .as_ref()
            .map(|f| f.is_database_filtered(db))
            .unwrap_or(false)
        {
            return true;
        }
        server
            .and_then(|s| self.replica_filters.get(s))
            .map(|f| f.is_database_filtered(db))
            .unwrap_or(false)
    }

    fn is_table_filtered(&self, db: &str, table: &str, server: Option<&ServerIdentity>) -> bool {
        if self.is_database_filtered(db, server) {
            return true;
        }
        server
            .and_then(|s| self.replica_filters.get(s))
            .map(|f| f.is_table_filtered(db, table))
            .unwrap_or(false)
    }

    /// 版本不一致只告警；返回告警文本
    pub async fn check_server_versions(&mut self) -> Result<Vec<String>> {
        let mut by_version: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(p) = &self.primary {
            let version = p.handle().variable("version").await?.unwrap_or_default();
            by_version
                .entry(version)
                .or_default()
                .push(format!("master '{}'", p.identity()));
        }
        for (identity, view) in &self.replicas {
            let version = view.handle().variable("version").await?.unwrap_or_default();
            by_version
                .entry(version)
                .or_default()
                .push(format!("slave '{}'", identity));
        }

        let mut warnings = Vec::new();
        if by_version.len() > 1 {
            warnings.push("Servers using different versions:".to_string());
            for (version, servers) in &by_version {
                warnings.push(format!("- {} for {}.", version, servers.join(", ")));
            }
            for w in &warnings {
                log::warn!("{}", w);
            }
            self.warnings.extend(warnings.iter().cloned());
        }
        Ok(warnings)
    }

    /// GTID 检查：主库必须开启；未开启的从库跳过；返回每个从库落后的事务
    pub async fn check_gtid_sync(&mut self) -> Result<Vec<(ServerIdentity, GtidSet)>> {
        if let Some(p) = &self.primary {
            if !p.gtid_enabled().await? {
                return Err(RplError::PrerequisiteError(format!(
                    "Master '{}' must have GTID_MODE=ON to check data consistency.",
                    p.identity()
                )));
            }
        }

        let mut kept = Vec::new();
        for (identity, view) in std::mem::take(&mut self.replicas) {
            if gtid_enabled(view.handle()).await? {
                kept.push((identity, view));
            } else {
                let msg = format!("Slave '{}' will be skipped - GTID disabled.", identity);
                log::warn!("{}", msg);
                self.warnings.push(msg);
            }
        }
        self.replicas = kept;

        if self.replicas.is_empty() {
            return Err(RplError::PrerequisiteError(
                "No slaves with GTID_MODE=ON found to check data consistency.".to_string(),
            ));
        }
        if self.primary.is_none() && self.replica_view(&self.base).is_none() {
            self.base = self.replicas[0].0.clone();
        }

        let mut behind = Vec::new();
        if let Some(p) = &self.primary {
            let executed = p.gtid_executed().await?;
            let results = fan_out(
                self.replicas.iter().map(|(id, v)| (id.clone(), v.clone())),
                None,
                |view| async move { view.gtid_executed().await },
            )
            .await;
            let (ok, _failed) = partition_results(results);
            for (identity, own) in ok {
                let missing = executed.subtract(&own);
                if missing.is_empty() {
                    log::info!("Slave '{}' is up-to-date.", identity);
                } else {
                    let count = missing.count();
                    log::info!(
                        "Slave '{}' is {} transaction{} behind master. Missing GTIDs: {}",
                        identity,
                        count,
                        if count > 1 { "s" } else { "" },
                        missing
                    );
                }
                behind.push((identity, missing));
            }
        }
        Ok(behind)
    }

    /// 同步要求从库版本不低于 5.6.14
    async fn check_sync_versions(&self) -> Result<()> {
        for (identity, view) in &self.replicas {
            let version = view.handle().variable("version").await?.unwrap_or_default();
            match parse_version(&version) {
                Some(v) if v >= MIN_SYNC_VERSION => {}
                _ => {
                    return Err(RplError::PrerequisiteError(format!(
                        "Server '{}' is version {}; version 5.6.14 or later is required to \
                         synchronize data (START SLAVE UNTIL SQL_AFTER_GTIDS).",
                        identity, version
                    )))
                }
            }
        }
        Ok(())
    }

    /// 版本、GTID、结构与数据的完整校验
    pub async fn run(&mut self) -> Result<SyncReport> {
        self.check_server_versions().await?;
        self.check_gtid_sync().await?;
        self.check_data_sync().await
    }

    /// 所有成员的登录账号权限，缺失项一次性报告
    pub async fn check_privileges(&self) -> Result<()> {
        let mut findings: Vec<PrivilegeFinding> = Vec::new();
        if let Some(p) = &self.primary {
            if let Some(mut finding) = missing_privileges(p.handle(), &PRIMARY_SYNC_PRIVILEGES).await? {
                let status = ["SUPER", "REPLICATION CLIENT"];
                let lacks_both = status.iter().all(|req| finding.missing.iter().any(|m| m == req));
                finding.missing.retain(|m| !status.contains(&m.as_str()));
                if lacks_both {
                    finding.missing.insert(0, "SUPER or REPLICATION CLIENT".to_string());
                }
                if !finding.missing.is_empty() {
                    findings.push(finding);
                }
            }
        }
        for (_, view) in &self.replicas {
            if let Some(finding) = missing_privileges(view.handle(), &REPLICA_SYNC_PRIVILEGES).await? {
                findings.push(finding);
            }
        }

        if findings.is_empty() {
            return Ok(());
        }
        for finding in &findings {
            log::error!("{}", finding.describe());
        }
        let detail: Vec<String> = findings.iter().map(|f| f.describe()).collect();
        Err(RplError::PrerequisiteError(format!(
            "Not enough privileges to check data consistency. {}",
            detail.join(" ")
        )))
    }

    /// 结构与数据校验
    pub async fn check_data_sync(&self) -> Result<SyncReport> {
        // 权限不足时不能停任何 SQL 线程
        self.check_privileges().await?;
        self.check_sync_versions().await?;

        let mut report = SyncReport::new(self.base.clone());
        report.warnings = self.warnings.clone();
        log::info!("Checking data consistency, using '{}' as base server.", self.base);

        let selection = &self.options.selection;
        let base = self.base_handle()?;
        let base_dbs: BTreeSet<String> = base
            .databases()
            .await?
            .into_iter()
            .filter(|db| selection.includes_database(db))
            .collect();

        let absent: Vec<&str> = selection
            .included_databases()
            .filter(|db| !base_dbs.contains(*db))
            .collect();
        if !absent.is_empty() {
            let msg = format!(
                "specified database(s) to check do not exist on base server: {}",
                absent.join(", ")
            );
            log::warn!("{}", msg);
            report.warnings.push(msg);
        }

        // 成员上的库，以及基准服务器上没有的库
        let mut member_dbs: HashMap<ServerIdentity, BTreeSet<String>> = HashMap::new();
        for identity in self.others() {
            let Some(view) = self.replica_view(&identity) else {
                continue;
            };
            let dbs: BTreeSet<String> = view
                .handle()
                .databases()
                .await?
                .into_iter()
                .filter(|db| selection.includes_database(db))
                .collect();
            let mut extra = Vec::new();
            for db in dbs.difference(&base_dbs) {
                if self.is_database_filtered(db, Some(&self.base)) {
                    report.push(SyncFinding::Skipped {
                        server: None,
                        object: format!("Database '{}'", db),
                        reason: "filtered by replication rule on base server".to_string(),
                    });
                } else {
                    extra.push(db.clone());
                }
            }
            if !extra.is_empty() {
                report.push(SyncFinding::DatabasesNotOnBase {
                    server: identity.clone(),
                    databases: extra,
                });
            }
            member_dbs.insert(identity, dbs);
        }

        let base_filter = if self.primary.is_some() {
            None
        } else {
            Some(self.base.clone())
        };

        for db in &base_dbs {
            if self.is_database_filtered(db, base_filter.as_ref()) {
                report.push(SyncFinding::Skipped {
                    server: None,
                    object: format!("Database '{}' check", db),
                    reason: "filtered by replication rule".to_string(),
                });
                continue;
            }
            log::info!("Checking '{}' database...", db);

            let base_tables: BTreeSet<String> = base
                .tables(db)
                .await?
                .into_iter()
                .filter(|t| selection.includes_table(db, t))
                .collect();

            let mut member_tables: Vec<(ServerIdentity, BTreeSet<String>)> = Vec::new();
            for identity in self.others() {
                if self.is_database_filtered(db, Some(&identity)) {
                    report.push(SyncFinding::Skipped {
                        server: Some(identity.clone()),
                        object: format!("Database '{}' check", db),
                        reason: "filtered by replication rule".to_string(),
                    });
                    continue;
                }
                let has_db = member_dbs
                    .get(&identity)
                    .map(|dbs| dbs.contains(db))
                    .unwrap_or(false);
                if !has_db {
                    report.push(SyncFinding::DatabaseMissing {
                        server: identity,
                        database: db.clone(),
                    });
                    continue;
                }
                let Some(view) = self.replica_view(&identity) else {
                    continue;
                };
                let tables: BTreeSet<String> = view
                    .handle()
                    .tables(db)
                    .await?
                    .into_iter()
                    .filter(|t| selection.includes_table(db, t))
                    .collect();

                let mut extra = Vec::new();
                for table in tables.difference(&base_tables) {
                    if self.is_table_filtered(db, table, Some(&self.base)) {
                        report.push(SyncFinding::Skipped {
                            server: None,
                            object: format!("Table '{}'", table),
                            reason: "filtered by replication rule on base server".to_string(),
                        });
                    } else {
                        extra.push(table.clone());
                    }
                }
                if !extra.is_empty() {
                    report.push(SyncFinding::TablesNotOnBase {
                        server: identity.clone(),
                        database: db.clone(),
                        tables: extra,
                    });
                }
                member_tables.push((identity, tables));
            }

            if member_tables.is_empty() {
                continue;
            }

            for table in &base_tables {
                let base_definition = base.table_definition(db, table).await?;
                let mut task = TableTask {
                    database: db.clone(),
                    table: table.clone(),
                    servers: Vec::new(),
                };

                for (identity, tables) in &member_tables {
                    if self.is_table_filtered(db, table, Some(identity)) {
                        report.push(SyncFinding::Skipped {
                            server: Some(identity.clone()),
                            object: format!("Table '{}.{}' check", db, table),
                            reason: "filtered by replication rule".to_string(),
                        });
                        continue;
                    }
                    if !tables.contains(table) {
                        report.push(SyncFinding::TableMissing {
                            server: identity.clone(),
                            database: db.clone(),
                            table: table.clone(),
                        });
                        continue;
                    }
                    let Some(view) = self.replica_view(identity) else {
                        continue;
                    };
                    let definition = view.handle().table_definition(db, table).await?;
                    let differs = match (&base_definition, &definition) {
                        (Some(a), Some(b)) => normalize_definition(a) != normalize_definition(b),
                        _ => base_definition != definition,
                    };
                    if differs {
                        report.push(SyncFinding::DefinitionDiffers {
                            server: identity.clone(),
                            database: db.clone(),
                            table: table.clone(),
                        });
                        continue;
                    }
                    task.servers.push(identity.clone());
                }

                if !task.servers.is_empty() {
                    log::info!("Checking '{}' table data...", table);
                    for finding in self.check_table_data_sync(&task).await? {
                        report.push(finding);
                    }
                }
            }
        }

        let issues = report.issue_count();
        SYNC_ISSUES_TOTAL.inc_by(issues as u64);
        log::info!("{}", report.summary());
        Ok(report)
    }

    /// 按同步点计算一张表在各成员上的校验和并与基准比对
    async fn check_table_data_sync(&self, task: &TableTask) -> Result<Vec<SyncFinding>> {
        let object = format!("`{}`.`{}`", task.database, task.table);
        let mut servers = task.servers.clone();
        if self.primary.is_none() && !servers.contains(&self.base) {
            servers.push(self.base.clone());
        }
        let views: Vec<(ServerIdentity, ReplicaView)> = servers
            .iter()
            .filter_map(|id| self.replica_view(id).map(|v| (id.clone(), v.clone())))
            .collect();

        let (active, inactive) = split_active(&views).await;
        let mut base_checksum: Option<Result<String>> = None;

        match &self.primary {
            Some(primary) => {
                primary.lock_table_read(&task.database, &task.table).await?;
                let captured = self.capture_primary_sync_point(primary, task, &active).await;
                if let Err(e) = primary.unlock_tables().await {
                    log::warn!("[{}] Failed to unlock tables: {}", primary.identity(), e);
                }
                base_checksum = Some(captured?);
            }
            None if !active.is_empty() => {
                let stopped = fan_out(active.iter().cloned(), None, |view| async move {
                    view.stop_sql_thread().await?;
                    view.gtid_executed().await
                })
                .await;
                let mut sync_point = GtidSet::new();
                let mut failure = None;
                for (identity, result) in stopped {
                    match result {
                        Ok(executed) => sync_point = sync_point.union(&executed),
                        Err(e) => failure = Some(RplError::ProtocolError(format!(
                            "Failed to stop SQL thread on '{}': {}",
                            identity, e
                        ))),
                    }
                }
                if let Some(e) = failure {
                    restart_sql_threads(&active).await;
                    return Err(e);
                }
                log::debug!("Sync point GTID: {}", sync_point);
                if let Err(e) = sync_replicas(&active, &sync_point).await {
                    restart_sql_threads(&active).await;
                    return Err(e);
                }
            }
            None => {}
        }

        let checksums = self.checksum_and_resume(&inactive, &active, task).await;
        let mut results: HashMap<ServerIdentity, Result<String>> = checksums.into_iter().collect();

        if base_checksum.is_none() {
            base_checksum = results.remove(&self.base);
        }

        let mut findings = Vec::new();
        let base_checksum = match base_checksum {
            Some(Ok(checksum)) => checksum,
            Some(Err(e)) => {
                findings.push(SyncFinding::Skipped {
                    server: Some(self.base.clone()),
                    object: format!("Table {} checksum", object),
                    reason: skip_reason(&e),
                });
                return Ok(findings);
            }
            None => return Ok(findings),
        };

        for identity in task.servers.iter().filter(|id| **id != self.base) {
            match results.remove(identity) {
                Some(Ok(checksum)) if checksum == base_checksum => {
                    findings.push(SyncFinding::ChecksumMatches {
                        server: identity.clone(),
                        database: task.database.clone(),
                        table: task.table.clone(),
                    })
                }
                Some(Ok(_)) => findings.push(SyncFinding::ChecksumDiffers {
                    server: identity.clone(),
                    database: task.database.clone(),
                    table: task.table.clone(),
                }),
                Some(Err(e)) => findings.push(SyncFinding::Skipped {
                    server: Some(identity.clone()),
                    object: format!("Table {} checksum", object),
                    reason: skip_reason(&e),
                }),
                None => {}
            }
        }
        Ok(findings)
    }

    /// 读锁持有期间取同步点、下发 UNTIL、计算主库校验和
    async fn capture_primary_sync_point(
        &self,
        primary: &PrimaryView,
        task: &TableTask,
        active: &[(ServerIdentity, ReplicaView)],
    ) -> Result<Result<String>> {
        let uuid = server_uuid(primary.handle()).await?;
        let sync_point = primary.gtid_executed().await?.last_of(&uuid);
        log::debug!("Sync point GTID: {}", sync_point);

        if !active.is_empty() {
            sync_replicas(active, &sync_point).await?;
        }
        Ok(checksum(primary.handle(), &task.database, &task.table, self.options.checksum_timeout).await)
    }

    async fn checksum_and_resume(
        &self,
        inactive: &[(ServerIdentity, ReplicaView)],
        active: &[(ServerIdentity, ReplicaView)],
        task: &TableTask,
    ) -> Vec<(ServerIdentity, Result<String>)> {
        let checksum_timeout = self.options.checksum_timeout;
        let rpl_timeout = self.options.rpl_timeout;
        let interval = self.options.sync_interval;

        let mut results = fan_out(inactive.iter().cloned(), None, |view| {
            let (db, table) = (task.database.clone(), task.table.clone());
            async move { checksum(view.handle(), &db, &table, checksum_timeout).await }
        })
        .await;

        let synced = fan_out(active.iter().cloned(), None, |view| {
            let (db, table) = (task.database.clone(), task.table.clone());
            async move {
                wait_checksum_and_resume(&view, &db, &table, rpl_timeout, interval, checksum_timeout).await
            }
        })
        .await;
        results.extend(synced);
        results
    }
}

/// 按 SQL 线程是否运行拆分；读不到状态的视为未运行
async fn split_active(
    views: &[(ServerIdentity, ReplicaView)],
) -> (Vec<(ServerIdentity, ReplicaView)>, Vec<(ServerIdentity, ReplicaView)>) {
    let statuses = fan_out(views.iter().cloned(), None, |view| async move { view.status().await }).await;

    let mut active = Vec::new();
    let mut inactive = Vec::new();
    for ((identity, view), (_, status)) in views.iter().cloned().zip(statuses) {
        match status {
            Ok(Some(s)) if s.sql_running => active.push((identity, view)),
            Ok(Some(s)) => {
                log::warn!(
                    "Slave not active '{}' - Sync point cannot be applied.",
                    identity
                );
                if s.has_io_error() {
                    log::warn!("IO thread stopped: ERROR {} - {}", s.last_io_errno, s.last_io_error);
                }
                if s.has_sql_error() {
                    log::warn!("SQL thread stopped: ERROR {} - {}", s.last_sql_errno, s.last_sql_error);
                }
                inactive.push((identity, view));
            }
            _ => inactive.push((identity, view)),
        }
    }
    (active, inactive)
}

/// 停 SQL 线程并以同步点为终点重启
async fn sync_replicas(replicas: &[(ServerIdentity, ReplicaView)], sync_point: &GtidSet) -> Result<()> {
    let results = fan_out(replicas.iter().cloned(), None, |view| {
        let until = sync_point.clone();
        async move {
            view.stop_sql_thread().await?;
            view.start_sql_thread_until(&until).await
        }
    })
    .await;
    let (_, failed) = partition_results(results);
    match failed.into_iter().next() {
        Some((identity, e)) => Err(RplError::ProtocolError(format!(
            "Failed to set synchronization point on '{}': {}",
            identity, e
        ))),
        None => Ok(()),
    }
}

async fn restart_sql_threads(replicas: &[(ServerIdentity, ReplicaView)]) {
    let results = fan_out(replicas.iter().cloned(), None, |view| async move {
        view.start_sql_thread().await
    })
    .await;
    partition_results(results);
}

async fn checksum(handle: &ServerHandle, db: &str, table: &str, limit: Duration) -> Result<String> {
    match tokio::time::timeout(limit, handle.table_checksum(db, table)).await {
        Ok(Ok(Some(checksum))) => Ok(checksum),
        Ok(Ok(None)) => Err(RplError::ConsistencyError(format!(
            "table `{}`.`{}` does not exist",
            db, table
        ))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RplError::TimeoutError("checksum timeout".to_string())),
    }
}

/// 等待 SQL 线程在同步点停下，计算校验和，然后恢复 SQL 线程
async fn wait_checksum_and_resume(
    view: &ReplicaView,
    db: &str,
    table: &str,
    rpl_timeout: Duration,
    interval: Duration,
    checksum_timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + rpl_timeout;
    let reached = loop {
        match view.status().await {
            Ok(Some(status)) if !status.sql_running => break Ok(true),
            Ok(Some(_)) => {}
            Ok(None) => break Ok(true),
            Err(e) => break Err(e),
        }
        if Instant::now() >= deadline {
            break Ok(false);
        }
        tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now()))).await;
    };

    let result = match reached {
        Ok(true) => checksum(view.handle(), db, table, checksum_timeout).await,
        Ok(false) => Err(RplError::TimeoutError(CATCH_UP_TIMEOUT.to_string())),
        Err(e) => Err(e),
    };

    if let Err(e) = view.start_sql_thread().await {
        log::warn!("[{}] Failed to restart SQL thread: {}", view.identity(), e);
    }
    result
}

fn skip_reason(error: &RplError) -> String {
    match error {
        RplError::TimeoutError(msg) | RplError::ConsistencyError(msg) => msg.clone(),
        other => other.to_string(),
    }
}
