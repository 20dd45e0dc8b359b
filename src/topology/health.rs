//! 拓扑健康表
//!
//! 主库：binlog 是否开启、是否存在复制账号。
//! 从库：线程状态、错误、延迟、位点 / GTID 差距、过滤规则一致性。
//! 不可达成员报告 DOWN，不抛错。

use super::TopologyRegistry;
use crate::gtid::GtidSet;
use crate::observability::{HEALTH_CHECK_TOTAL, REPLICAS_UNHEALTHY};
use crate::replication::{binlog_filters_match, MasterStatus, ReplicationStatusSnapshot};
use crate::server::view::gtid_mode;
use crate::server::{PrimaryView, ReplicaView, ServerIdentity};
use crate::utils::config::RplConfig;
use crate::{Result, RplError};
use chrono::Utc;
use serde::Serialize;
use std::fmt;

pub const HEALTH_COLUMNS: [&str; 6] = ["host", "port", "role", "state", "gtid_mode", "health"];

pub const HEALTH_DETAIL_COLUMNS: [&str; 12] = [
    "version",
    "master_log_file",
    "master_log_pos",
    "IO_Thread",
    "SQL_Thread",
    "Secs_Behind",
    "Remaining_Delay",
    "IO_Error_Num",
    "IO_Error",
    "SQL_Error_Num",
    "SQL_Error",
    "Trans_Behind",
];

const HEALTH_OK: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerRole {
    Master,
    Slave,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Master => write!(f, "MASTER"),
            ServerRole::Slave => write!(f, "SLAVE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerState {
    Up,
    Down,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Up => write!(f, "UP"),
            ServerState::Down => write!(f, "DOWN"),
        }
    }
}

/// 阈值，0 表示不检查
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthThresholds {
    pub max_delay: u64,
    pub max_position: u64,
    /// 输出详细列
    pub verbose: bool,
}

impl HealthThresholds {
    pub fn from_config(config: &RplConfig) -> Self {
        Self {
            max_delay: config.max_delay,
            max_position: config.max_position,
            verbose: config.verbosity > 0,
        }
    }
}

/// 健康表中的一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRow {
    pub identity: ServerIdentity,
    pub role: ServerRole,
    pub state: ServerState,
    pub gtid_mode: String,
    /// 健康时为空
    pub issues: Vec<String>,
    /// 详细列，verbose 时填充
    pub details: Vec<String>,
}

impl HealthRow {
    fn down(identity: ServerIdentity, role: ServerRole, issue: &str) -> Self {
        Self {
            identity,
            role,
            state: ServerState::Down,
            gtid_mode: String::new(),
            issues: vec![issue.to_string()],
            details: Vec::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    /// health 列文本
    pub fn health(&self) -> String {
        if self.issues.is_empty() {
            HEALTH_OK.to_string()
        } else {
            self.issues.join(", ")
        }
    }

    pub fn cells(&self, verbose: bool) -> Vec<String> {
        let mut cells = vec![
            self.identity.host.clone(),
            self.identity.port.to_string(),
            self.role.to_string(),
            self.state.to_string(),
            self.gtid_mode.clone(),
            self.health(),
        ];
        if verbose {
            let mut details = self.details.clone();
            details.resize(HEALTH_DETAIL_COLUMNS.len(), String::new());
            cells.extend(details);
        }
        cells
    }
}

/// 健康表
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// 生成时间 (毫秒时间戳)
    pub generated_at: i64,
    #[serde(skip)]
    pub verbose: bool,
    pub rows: Vec<HealthRow>,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            generated_at: Utc::now().timestamp_millis(),
            verbose: false,
            rows: Vec::new(),
        }
    }
}

impl HealthReport {
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = HEALTH_COLUMNS.to_vec();
        if self.verbose {
            columns.extend(HEALTH_DETAIL_COLUMNS);
        }
        columns
    }

    pub fn row(&self, identity: &ServerIdentity) -> Option<&HealthRow> {
        self.rows.iter().find(|r| r.identity.same_server(identity))
    }

    pub fn unhealthy_replicas(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.role == ServerRole::Slave && !r.is_healthy())
            .count()
    }

    /// JSON 导出
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RplError::IOError(format!("Failed to serialize health report: {}", e)))
    }

    /// 渲染为对齐的文本表格
    pub fn render(&self) -> String {
        render_grid(
            &self.columns(),
            &self.rows.iter().map(|r| r.cells(self.verbose)).collect::<Vec<_>>(),
        )
    }
}

/// 通用文本表格
pub fn render_grid(columns: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let separator = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let line = |cells: Vec<&str>| {
        let body = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!(" {:<width$} ", c, width = w))
            .collect::<Vec<_>>()
            .join("|");
        format!("|{}|", body)
    };

    let mut out = vec![separator.clone(), line(columns.to_vec()), separator.clone()];
    for row in rows {
        out.push(line(row.iter().map(String::as_str).collect()));
    }
    out.push(separator);
    out.join("\n")
}

/// 主库健康问题
pub async fn primary_health(primary: &PrimaryView) -> Result<Vec<String>> {
    let mut issues = Vec::new();
    if !primary.gtid_enabled().await? && !primary.binlog_enabled().await? {
        issues.push("No binlog on master.".to_string());
    }
    if primary.replication_users().await?.is_empty() {
        issues.push("There are no users with replication privileges.".to_string());
    }
    Ok(issues)
}

/// 候选服务器与主库的 binlog 过滤规则一致
pub async fn binlog_filters_agree(primary: &PrimaryView, candidate: &PrimaryView) -> Result<bool> {
    let (p_do, p_ignore) = primary.binlog_filters().await?;
    let (c_do, c_ignore) = candidate.binlog_filters().await?;
    let agree = binlog_filters_match(&p_do, &p_ignore, &c_do, &c_ignore);
    if !agree {
        log::debug!(
            "[{}] Filter check failed: master do={:?} ignore={:?}, [{}] do={:?} ignore={:?}",
            primary.identity(),
            p_do,
            p_ignore,
            candidate.identity(),
            c_do,
            c_ignore
        );
    }
    Ok(agree)
}

/// 从库健康问题
///
/// 未连接到正确主库时只返回这一条。
pub fn replica_issues(
    status: &ReplicationStatusSnapshot,
    primary: &ServerIdentity,
    primary_status: Option<&MasterStatus>,
    gtid_behind: Option<u64>,
    thresholds: &HealthThresholds,
) -> Vec<String> {
    if !status.upstream().same_server(primary) {
        return vec!["Not connected to correct master.".to_string()];
    }

    let mut issues = Vec::new();
    if !status.io_running() {
        issues.push("IO thread is not running.".to_string());
    }
    if !status.sql_running {
        issues.push("SQL thread is not running.".to_string());
    }
    if status.has_io_error() {
        issues.push(status.last_io_error.clone());
    }

    let delay = status.seconds_behind.unwrap_or(0);
    if thresholds.max_delay > 0 && delay > thresholds.max_delay {
        issues.push(format!("Slave delay is {} seconds behind master.", delay));
        if let Some(remaining) = status.sql_remaining_delay {
            issues.push(format!("Remaining delay is {} seconds.", remaining));
        }
    }

    match gtid_behind {
        Some(behind) if behind > 0 => {
            issues.push(format!("Slave has {} transactions behind master.", behind));
        }
        Some(_) => {}
        None => {
            if let Some(master) = primary_status {
                if status.master_log_file != master.log_file {
                    issues.push("Wrong master log file.".to_string());
                } else if thresholds.max_position > 0
                    && status.read_master_log_pos + thresholds.max_position < master.log_position
                {
                    issues.push("Slave's master position exceeds maximum.".to_string());
                }
            }
        }
    }
    issues
}

fn replica_details(
    version: String,
    status: &ReplicationStatusSnapshot,
    gtid_behind: Option<u64>,
) -> Vec<String> {
    vec![
        version,
        status.master_log_file.clone(),
        status.read_master_log_pos.to_string(),
        status.io_thread.as_str().to_string(),
        if status.sql_running { "Yes" } else { "No" }.to_string(),
        status.seconds_behind.unwrap_or(0).to_string(),
        status
            .sql_remaining_delay
            .map(|d| d.to_string())
            .unwrap_or_else(|| "No".to_string()),
        status.last_io_errno.to_string(),
        status.last_io_error.clone(),
        status.last_sql_errno.to_string(),
        status.last_sql_error.clone(),
        gtid_behind.map(|n| n.to_string()).unwrap_or_default(),
    ]
}

impl TopologyRegistry {
    /// 生成健康表并更新指标
    pub async fn health(&self, thresholds: &HealthThresholds) -> HealthReport {
        HEALTH_CHECK_TOTAL.inc();

        let mut report = HealthReport {
            verbose: thresholds.verbose,
            ..HealthReport::default()
        };

        // 主库部分
        let mut primary_context: Option<(PrimaryView, Option<MasterStatus>, Option<GtidSet>)> = None;
        if let Some(primary) = self.primary() {
            match self.primary_row(&primary.view, thresholds).await {
                Ok((row, status, executed)) => {
                    report.rows.push(row);
                    primary_context = Some((primary.view.clone(), status, executed));
                }
                Err(e) => {
                    log::warn!("[{}] Cannot read master health: {}", primary.identity, e);
                    report
                        .rows
                        .push(HealthRow::down(primary.identity.clone(), ServerRole::Master, "Cannot connect to master."));
                }
            }
        }

        let mut replica_rows = Vec::new();
        for record in self.replicas() {
            let handle = match &record.handle {
                Some(handle) if handle.is_alive().await || handle.reconnect().await.is_ok() => handle,
                _ => {
                    replica_rows.push(HealthRow::down(
                        record.identity.clone(),
                        ServerRole::Slave,
                        "Cannot connect to slave.",
                    ));
                    continue;
                }
            };
            let row = match &primary_context {
                None => {
                    let mut row = HealthRow::down(record.identity.clone(), ServerRole::Slave, "No master specified.");
                    row.state = ServerState::Up;
                    row
                }
                Some((primary, status, executed)) => {
                    let view = ReplicaView::new(handle.clone());
                    match Self::replica_row(&view, primary, status.as_ref(), executed.as_ref(), thresholds).await {
                        Ok(row) => row,
                        Err(e) => {
                            log::warn!("[{}] Cannot read slave health: {}", record.identity, e);
                            HealthRow::down(record.identity.clone(), ServerRole::Slave, "Cannot connect to slave.")
                        }
                    }
                }
            };
            replica_rows.push(row);
        }

        replica_rows.sort_by(|a, b| a.identity.cmp(&b.identity));
        report.rows.extend(replica_rows);

        REPLICAS_UNHEALTHY.set(report.unhealthy_replicas() as i64);
        report
    }

    async fn primary_row(
        &self,
        primary: &PrimaryView,
        thresholds: &HealthThresholds,
    ) -> Result<(HealthRow, Option<MasterStatus>, Option<GtidSet>)> {
        let identity = primary.identity();
        log::info!("[{}] Getting health for master", identity);

        let mode = gtid_mode(primary.handle()).await?;
        let issues = primary_health(primary).await?;
        let status = primary.status().await?;
        let executed = if mode == "ON" {
            Some(primary.gtid_executed().await?)
        } else {
            None
        };

        let mut details = Vec::new();
        if thresholds.verbose {
            let version = primary.handle().variable("version").await?.unwrap_or_default();
            details.push(version);
            details.push(status.as_ref().map(|s| s.log_file.clone()).unwrap_or_default());
            details.push(status.as_ref().map(|s| s.log_position.to_string()).unwrap_or_default());
        }

        let row = HealthRow {
            identity,
            role: ServerRole::Master,
            state: ServerState::Up,
            gtid_mode: mode,
            issues,
            details,
        };
        Ok((row, status, executed))
    }

    async fn replica_row(
        view: &ReplicaView,
        primary: &PrimaryView,
        primary_status: Option<&MasterStatus>,
        primary_executed: Option<&GtidSet>,
        thresholds: &HealthThresholds,
    ) -> Result<HealthRow> {
        let identity = view.identity();
        let mode = gtid_mode(view.handle()).await?;

        let status = match view.status().await? {
            Some(status) => status,
            None => {
                return Ok(HealthRow {
                    identity,
                    role: ServerRole::Slave,
                    state: ServerState::Up,
                    gtid_mode: mode,
                    issues: vec!["Not connected".to_string()],
                    details: Vec::new(),
                })
            }
        };

        let gtid_behind = match (mode.as_str(), primary_executed) {
            ("ON", Some(executed)) => Some(view.transactions_behind(executed).await?),
            _ => None,
        };

        let mut issues = replica_issues(
            &status,
            &primary.identity(),
            primary_status,
            gtid_behind,
            thresholds,
        );
        if issues.is_empty() && !binlog_filters_agree(primary, &view.as_primary()).await? {
            issues.push("Binary log and Relay log filters differ.".to_string());
        }

        let details = if thresholds.verbose {
            let version = view.handle().variable("version").await?.unwrap_or_default();
            replica_details(version, &status, gtid_behind)
        } else {
            Vec::new()
        };

        Ok(HealthRow {
            identity,
            role: ServerRole::Slave,
            state: ServerState::Up,
            gtid_mode: mode,
            issues,
            details,
        })
    }
}
