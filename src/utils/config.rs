//! 配置管理模块
//!
//! 文件中的取值先加载，命令行参数随后覆盖；启动时统一校验一次。

use crate::server::{ConnectionSpec, Credentials};
use crate::replication::SslOptions;
use crate::{Result, RplError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/rpl.toml";

/// 守护进程故障处理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    /// 候选不合格时回退到全部从库
    Auto,
    /// 只在候选列表中选主
    Elect,
    /// 只报告故障，不切换
    Fail,
}

impl FromStr for FailoverMode {
    type Err = RplError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(FailoverMode::Auto),
            "elect" => Ok(FailoverMode::Elect),
            "fail" => Ok(FailoverMode::Fail),
            other => Err(RplError::ConfigError(format!(
                "unknown failover mode '{}', expected auto, elect or fail",
                other
            ))),
        }
    }
}

/// 多源轮转周期内报告的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportValue {
    Health,
    Gtid,
    Uuid,
}

impl FromStr for ReportValue {
    type Err = RplError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "health" => Ok(ReportValue::Health),
            "gtid" => Ok(ReportValue::Gtid),
            "uuid" => Ok(ReportValue::Uuid),
            other => Err(RplError::ConfigError(format!(
                "unknown report value '{}', expected health, gtid or uuid",
                other
            ))),
        }
    }
}

impl ReportValue {
    /// 解析逗号分隔列表
    pub fn parse_list(text: &str) -> Result<Vec<ReportValue>> {
        text.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(ReportValue::from_str)
            .collect()
    }
}

/// 复制管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RplConfig {
    /// 主库连接串 user[:pass]@host[:port]
    #[serde(default)]
    pub primary: Option<String>,

    /// 从库连接串
    #[serde(default)]
    pub replicas: Vec<String>,

    /// 故障切换候选
    #[serde(default)]
    pub candidates: Vec<String>,

    /// 发现从库时使用的登录 user[:pass]
    #[serde(default)]
    pub discover: Option<String>,

    /// 复制账号 user[:pass]
    #[serde(default)]
    pub rpl_user: Option<String>,

    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub pedantic: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub verbosity: u8,

    /// 最大允许延迟秒数，0 为不检查
    #[serde(default)]
    pub max_delay: u64,

    /// 最大允许位点差，0 为不检查
    #[serde(default)]
    pub max_position: u64,

    /// 等待超时 (秒)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// 存活探测间隔 (秒)
    #[serde(default = "default_ping")]
    pub ping: u64,

    /// 守护进程检查间隔 (秒)
    #[serde(default = "default_interval")]
    pub interval: u64,

    #[serde(default)]
    pub fail_retry: Option<u64>,

    #[serde(default = "default_failover_mode")]
    pub failover_mode: FailoverMode,

    #[serde(default)]
    pub before: Option<PathBuf>,
    #[serde(default)]
    pub after: Option<PathBuf>,
    #[serde(default)]
    pub exec_fail: Option<PathBuf>,
    #[serde(default)]
    pub post_fail: Option<PathBuf>,

    /// 脚本退出码达到该值时中止
    #[serde(default)]
    pub script_threshold: Option<i32>,

    /// 切换后把旧主库挂到新主库下
    #[serde(default)]
    pub demote: bool,

    #[serde(default)]
    pub no_health: bool,

    /// 多源轮转时间片 (秒)
    #[serde(default = "default_switchover_interval")]
    pub switchover_interval: u64,

    #[serde(default = "default_report_values")]
    pub report_values: Vec<ReportValue>,

    /// 一致性检查：等待追平的超时 (秒)
    #[serde(default = "default_rpl_timeout")]
    pub rpl_timeout: u64,

    /// 一致性检查：单表校验和超时 (秒)
    #[serde(default = "default_checksum_timeout")]
    pub checksum_timeout: u64,

    /// 一致性检查：轮询间隔 (秒)
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// 一致性检查范围 db 或 db.table
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub ssl_ca: Option<String>,
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
}

fn default_timeout() -> u64 {
    300
}

fn default_ping() -> u64 {
    3
}

fn default_interval() -> u64 {
    15
}

fn default_failover_mode() -> FailoverMode {
    FailoverMode::Auto
}

fn default_switchover_interval() -> u64 {
    60
}

fn default_report_values() -> Vec<ReportValue> {
    vec![ReportValue::Health]
}

fn default_rpl_timeout() -> u64 {
    300
}

fn default_checksum_timeout() -> u64 {
    5
}

fn default_sync_interval() -> u64 {
    3
}

impl Default for RplConfig {
    fn default() -> Self {
        Self {
            primary: None,
            replicas: Vec::new(),
            candidates: Vec::new(),
            discover: None,
            rpl_user: None,
            force: false,
            pedantic: false,
            quiet: false,
            verbosity: 0,
            max_delay: 0,
            max_position: 0,
            timeout: default_timeout(),
            ping: default_ping(),
            interval: default_interval(),
            fail_retry: None,
            failover_mode: default_failover_mode(),
            before: None,
            after: None,
            exec_fail: None,
            post_fail: None,
            script_threshold: None,
            demote: false,
            no_health: false,
            switchover_interval: default_switchover_interval(),
            report_values: default_report_values(),
            rpl_timeout: default_rpl_timeout(),
            checksum_timeout: default_checksum_timeout(),
            sync_interval: default_sync_interval(),
            include: Vec::new(),
            exclude: Vec::new(),
            ssl_ca: None,
            ssl_cert: None,
            ssl_key: None,
        }
    }
}

impl RplConfig {
    /// 从文件加载
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RplError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| RplError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    /// 加载默认配置文件，不存在时使用默认值
    pub fn load_default() -> Self {
        match Self::load_from_file(DEFAULT_CONFIG_PATH) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// 启动时校验
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("ping", self.ping),
            ("interval", self.interval),
            ("timeout", self.timeout),
            ("switchover_interval", self.switchover_interval),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RplError::ConfigError(format!(
                    "option {} must be a positive number of seconds",
                    name
                )));
            }
        }

        let primary = self.primary_spec()?;
        let replicas = self.replica_specs()?;
        if let Some(primary) = &primary {
            let identity = primary.identity();
            if let Some(dup) = replicas.iter().find(|r| r.identity().same_server(&identity)) {
                return Err(RplError::ConfigError(format!(
                    "The master {} is also listed as a slave ({})",
                    identity,
                    dup.identity()
                )));
            }
        }
        self.candidate_specs()?;
        self.rpl_credentials()?;
        self.discover_credentials()?;
        Ok(())
    }

    pub fn primary_spec(&self) -> Result<Option<ConnectionSpec>> {
        self.primary
            .as_deref()
            .map(|p| p.parse::<ConnectionSpec>().map(|s| self.with_ssl(s)))
            .transpose()
    }

    pub fn replica_specs(&self) -> Result<Vec<ConnectionSpec>> {
        self.parse_specs(&self.replicas)
    }

    pub fn candidate_specs(&self) -> Result<Vec<ConnectionSpec>> {
        self.parse_specs(&self.candidates)
    }

    fn parse_specs(&self, list: &[String]) -> Result<Vec<ConnectionSpec>> {
        let mut specs = Vec::new();
        for item in list {
            for spec in ConnectionSpec::parse_list(item)? {
                specs.push(self.with_ssl(spec));
            }
        }
        Ok(specs)
    }

    fn with_ssl(&self, mut spec: ConnectionSpec) -> ConnectionSpec {
        if !spec.ssl.is_enabled() {
            spec.ssl = self.ssl_options();
        }
        spec
    }

    pub fn ssl_options(&self) -> SslOptions {
        SslOptions::from_paths(self.ssl_ca.clone(), self.ssl_cert.clone(), self.ssl_key.clone())
    }

    pub fn rpl_credentials(&self) -> Result<Option<Credentials>> {
        self.rpl_user.as_deref().map(Credentials::from_str).transpose()
    }

    pub fn discover_credentials(&self) -> Result<Option<Credentials>> {
        self.discover.as_deref().map(Credentials::from_str).transpose()
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn ping_duration(&self) -> Duration {
        Duration::from_secs(self.ping)
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RplConfig::default();
        assert_eq!(config.ping, 3);
        assert_eq!(config.timeout, 300);
        assert_eq!(config.interval, 15);
        assert_eq!(config.switchover_interval, 60);
        assert_eq!(config.rpl_timeout, 300);
        assert_eq!(config.checksum_timeout, 5);
        assert_eq!(config.sync_interval, 3);
        assert_eq!(config.failover_mode, FailoverMode::Auto);
        assert_eq!(config.report_values, vec![ReportValue::Health]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
primary = "root:root@db1:3306"
replicas = ["root:root@db2:3306,root:root@db3"]
failover_mode = "elect"
report_values = ["gtid", "uuid"]
ping = 5
"#
        )
        .unwrap();

        let config = RplConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.ping, 5);
        assert_eq!(config.timeout, 300);
        assert_eq!(config.failover_mode, FailoverMode::Elect);
        assert_eq!(config.replica_specs().unwrap().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = RplConfig {
            ping: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RplConfig {
            primary: Some("root@db1:3306".into()),
            replicas: vec!["root@db1".into()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("also listed as a slave"));

        assert!("sometimes".parse::<FailoverMode>().is_err());
        assert!(ReportValue::parse_list("health,disk").is_err());
    }
}
