//! CHANGE MASTER 命令构造

use crate::replication::MasterStatus;
use crate::server::statement::escape_literal;
use crate::server::{Credentials, ServerIdentity};
use serde::{Deserialize, Serialize};

/// 传输安全参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslOptions {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl SslOptions {
    pub fn is_enabled(&self) -> bool {
        self.allowed || self.ca.is_some() || self.cert.is_some() || self.key.is_some()
    }

    /// 只要给了任一证书参数即视为开启
    pub fn from_paths(ca: Option<String>, cert: Option<String>, key: Option<String>) -> Self {
        let allowed = ca.is_some() || cert.is_some() || key.is_some();
        Self {
            allowed,
            ca,
            cert,
            key,
        }
    }
}

/// 定位方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Positioning {
    /// MASTER_AUTO_POSITION=1
    AutoPosition,

    /// 显式日志坐标，position 为 None 时只给文件名
    LogCoordinates {
        file: String,
        position: Option<u64>,
    },

    /// 不指定位置 (从头开始)
    FromBeginning,
}

/// 重指向上游命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMasterCommand {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl: SslOptions,
    pub positioning: Positioning,
}

impl ChangeMasterCommand {
    pub fn new(upstream: &ServerIdentity) -> Self {
        Self {
            host: upstream.host.clone(),
            port: upstream.port,
            user: None,
            password: None,
            ssl: SslOptions::default(),
            positioning: Positioning::FromBeginning,
        }
    }

    /// 按副本的 GTID 模式与上游状态选择定位方式
    ///
    /// - 副本 GTID_MODE=ON: 自动定位
    /// - 否则除非 from_beginning，使用上游当前日志坐标
    pub fn for_upstream(
        upstream: &ServerIdentity,
        credentials: &Credentials,
        ssl: &SslOptions,
        replica_gtid_on: bool,
        from_beginning: bool,
        upstream_status: Option<&MasterStatus>,
    ) -> Self {
        let positioning = if replica_gtid_on {
            Positioning::AutoPosition
        } else if from_beginning {
            Positioning::FromBeginning
        } else {
            match upstream_status {
                Some(status) => Positioning::LogCoordinates {
                    file: status.log_file.clone(),
                    position: Some(status.log_position),
                },
                None => Positioning::FromBeginning,
            }
        };

        Self::new(upstream)
            .with_credentials(credentials)
            .with_ssl(ssl.clone())
            .with_positioning(positioning)
    }

    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        self.user = Some(credentials.user.clone());
        self.password = credentials.password.clone();
        self
    }

    pub fn with_ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_positioning(mut self, positioning: Positioning) -> Self {
        self.positioning = positioning;
        self
    }

    /// 新上游身份
    pub fn upstream(&self) -> ServerIdentity {
        ServerIdentity::new(self.host.clone(), self.port)
    }

    pub fn to_sql(&self) -> String {
        self.render(false)
    }

    /// 密码打码后的文本，用于日志
    pub fn to_masked_sql(&self) -> String {
        self.render(true)
    }

    fn render(&self, mask: bool) -> String {
        let mut sql = format!("CHANGE MASTER TO MASTER_HOST = '{}', ", escape_literal(&self.host));

        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            sql.push_str(&format!("MASTER_USER = '{}', ", escape_literal(user)));
        }
        // 空密码也要下发，用于覆盖旧密码
        if let Some(password) = &self.password {
            let shown = if mask { "****".to_string() } else { escape_literal(password) };
            sql.push_str(&format!("MASTER_PASSWORD = '{}', ", shown));
        }
        sql.push_str(&format!("MASTER_PORT = {}", self.port));

        if self.ssl.allowed {
            sql.push_str(", MASTER_SSL = 1");
        }
        if let Some(ca) = &self.ssl.ca {
            sql.push_str(&format!(", MASTER_SSL_CA = '{}'", escape_literal(ca)));
        }
        if let Some(cert) = self.ssl.cert.as_deref().filter(|c| !c.is_empty()) {
            sql.push_str(&format!(", MASTER_SSL_CERT = '{}'", escape_literal(cert)));
        }
        if let Some(key) = self.ssl.key.as_deref().filter(|k| !k.is_empty()) {
            sql.push_str(&format!(", MASTER_SSL_KEY = '{}'", escape_literal(key)));
        }

        match &self.positioning {
            Positioning::AutoPosition => sql.push_str(", MASTER_AUTO_POSITION=1"),
            Positioning::LogCoordinates { file, position } => {
                sql.push_str(&format!(", MASTER_LOG_FILE = '{}'", escape_literal(file)));
                if let Some(pos) = position {
                    sql.push_str(&format!(", MASTER_LOG_POS = {}", pos));
                }
            }
            Positioning::FromBeginning => {}
        }

        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::GtidSet;

    fn status() -> MasterStatus {
        MasterStatus {
            log_file: "mysql-bin.000003".to_string(),
            log_position: 1543,
            binlog_do_db: vec![],
            binlog_ignore_db: vec![],
            executed_gtid_set: GtidSet::new(),
        }
    }

    #[test]
    fn test_gtid_auto_position() {
        let cmd = ChangeMasterCommand::for_upstream(
            &ServerIdentity::new("db2", 3307),
            &Credentials::new("rpl", Some("secret".into())),
            &SslOptions::default(),
            true,
            false,
            Some(&status()),
        );
        assert_eq!(
            cmd.to_sql(),
            "CHANGE MASTER TO MASTER_HOST = 'db2', MASTER_USER = 'rpl', \
             MASTER_PASSWORD = 'secret', MASTER_PORT = 3307, MASTER_AUTO_POSITION=1"
        );
        assert_eq!(cmd.upstream(), ServerIdentity::new("db2", 3307));
    }

    #[test]
    fn test_log_coordinates_and_ssl() {
        let ssl = SslOptions::from_paths(Some("/ca.pem".into()), Some("/cert.pem".into()), None);
        let cmd = ChangeMasterCommand::for_upstream(
            &ServerIdentity::new("[::1]", 3306),
            &Credentials::new("rpl", Some(String::new())),
            &ssl,
            false,
            false,
            Some(&status()),
        );
        assert_eq!(
            cmd.to_sql(),
            "CHANGE MASTER TO MASTER_HOST = '::1', MASTER_USER = 'rpl', MASTER_PASSWORD = '', \
             MASTER_PORT = 3306, MASTER_SSL = 1, MASTER_SSL_CA = '/ca.pem', \
             MASTER_SSL_CERT = '/cert.pem', MASTER_LOG_FILE = 'mysql-bin.000003', MASTER_LOG_POS = 1543"
        );
    }

    #[test]
    fn test_from_beginning_omits_position() {
        let cmd = ChangeMasterCommand::for_upstream(
            &ServerIdentity::new("db1", 3306),
            &Credentials::new("rpl", None),
            &SslOptions::default(),
            false,
            true,
            Some(&status()),
        );
        assert!(cmd.to_sql().ends_with("MASTER_PORT = 3306"));
        assert!(!cmd.to_sql().contains("MASTER_PASSWORD"));
    }

    #[test]
    fn test_masked_password() {
        let cmd = ChangeMasterCommand::new(&ServerIdentity::new("db1", 3306))
            .with_credentials(&Credentials::new("rpl", Some("topsecret".into())));
        assert!(cmd.to_masked_sql().contains("MASTER_PASSWORD = '****'"));
        assert!(!cmd.to_masked_sql().contains("topsecret"));
    }
}
