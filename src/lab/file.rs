//! 模拟拓扑文件 (TOML)
//!
//! ```toml
//! rpl_user = "rpl:rpl"
//!
//! [[servers]]
//! host = "db1"
//! transactions = 10
//!
//! [[servers]]
//! host = "db2"
//! master = "db1:3306"
//!
//! [[tables]]
//! database = "shop"
//! name = "orders"
//! rows = 5
//! ```

use super::{LabCluster, LabServer, LabUser};
use crate::replication::ReplicaFilterRules;
use crate::server::{Credentials, ServerIdentity, DEFAULT_PORT};
use crate::{Result, RplError};
use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_rpl_user() -> String {
    "rpl:rpl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabUserEntry {
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub privileges: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabServerEntry {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub server_id: Option<u32>,
    pub uuid: Option<String>,
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub alive: bool,
    #[serde(default = "default_true")]
    pub gtid_mode: bool,
    #[serde(default = "default_true")]
    pub log_bin: bool,
    #[serde(default)]
    pub read_only: bool,
    /// 上游 host[:port]
    pub master: Option<String>,
    /// 启动时本地提交的事务数
    #[serde(default)]
    pub transactions: u64,
    #[serde(default)]
    pub lag_seconds: u64,
    #[serde(default)]
    pub binlog_do_db: Vec<String>,
    #[serde(default)]
    pub binlog_ignore_db: Vec<String>,
    #[serde(default)]
    pub filters: ReplicaFilterRules,
    pub report_host: Option<String>,
    pub master_info_repository: Option<String>,
    /// 额外账号 (root / rpl 始终存在)
    #[serde(default)]
    pub users: Vec<LabUserEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabTableEntry {
    pub database: String,
    pub name: String,
    pub definition: Option<String>,
    /// 在主库上写入的事务数
    #[serde(default)]
    pub rows: u64,
    /// 写入所在服务器，缺省为第一个无上游的服务器
    pub written_on: Option<String>,
}

/// 拓扑文件
#[derive(Debug, Clone, Deserialize)]
pub struct LabTopologyFile {
    #[serde(default = "default_rpl_user")]
    pub rpl_user: String,
    #[serde(default)]
    pub servers: Vec<LabServerEntry>,
    #[serde(default)]
    pub tables: Vec<LabTableEntry>,
}

fn parse_host_port(text: &str) -> ServerIdentity {
    match text.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') => match port.parse::<u16>() {
            Ok(port) => ServerIdentity::new(host, port),
            Err(_) => ServerIdentity::new(text, DEFAULT_PORT),
        },
        _ => ServerIdentity::new(text, DEFAULT_PORT),
    }
}

impl LabTopologyFile {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| {
            RplError::ConfigError(format!(
                "Failed to parse lab topology {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// 构建集群：建服务器、建表、本地事务、接复制
    pub fn build(&self) -> Result<LabCluster> {
        let rpl: Credentials = self.rpl_user.parse()?;
        let cluster = LabCluster::new();

        for (index, entry) in self.servers.iter().enumerate() {
            let mut server = LabServer::new(
                &entry.host,
                entry.port,
                entry.server_id.unwrap_or(index as u32 + 1),
            );
            if let Some(uuid) = &entry.uuid {
                server.uuid = uuid.to_ascii_lowercase();
            }
            if let Some(version) = &entry.version {
                server.version = version.clone();
            }
            if let Some(repo) = &entry.master_info_repository {
                server.master_info_repository = repo.clone();
            }
            server.gtid_mode = entry.gtid_mode;
            server.log_bin = entry.log_bin;
            server.lag_seconds = entry.lag_seconds;
            server.binlog_do_db = entry.binlog_do_db.clone();
            server.binlog_ignore_db = entry.binlog_ignore_db.clone();
            server.filters = entry.filters.clone();
            server.report_host = entry.report_host.clone();
            if server.user(&rpl.user).is_none() {
                server
                    .users
                    .push(LabUser::new(&rpl.user, rpl.password_or_empty(), &["REPLICATION SLAVE"]));
            }
            for user in &entry.users {
                let privileges: Vec<&str> = user.privileges.iter().map(String::as_str).collect();
                server.users.retain(|u| u.account.user != user.user);
                server
                    .users
                    .push(LabUser::new(&user.user, &user.password, &privileges));
            }
            cluster.add_server(server);
        }

        for table in &self.tables {
            let definition = table.definition.clone().unwrap_or_else(|| {
                format!("CREATE TABLE `{}` (`id` INT PRIMARY KEY)", table.name)
            });
            cluster.create_table(&table.database, &table.name, &definition);
        }

        for entry in &self.servers {
            if let Some(master) = &entry.master {
                let replica = ServerIdentity::new(&entry.host, entry.port);
                cluster.attach(&replica, &parse_host_port(master), &rpl)?;
            }
        }

        for entry in &self.servers {
            if entry.transactions > 0 {
                cluster.commit(&ServerIdentity::new(&entry.host, entry.port), entry.transactions)?;
            }
        }

        let first_root = self
            .servers
            .iter()
            .find(|s| s.master.is_none())
            .map(|s| ServerIdentity::new(&s.host, s.port));
        for table in &self.tables {
            let target = table
                .written_on
                .as_deref()
                .map(parse_host_port)
                .or_else(|| first_root.clone());
            if let (Some(target), true) = (target, table.rows > 0) {
                cluster.commit_to_table(&target, &table.database, &table.name, table.rows)?;
            }
        }

        // 最后才让声明为宕机的服务器下线，保证初始数据已复制
        for entry in &self.servers {
            if !entry.alive {
                cluster.set_alive(&ServerIdentity::new(&entry.host, entry.port), false);
            }
        }
        for entry in &self.servers {
            if entry.read_only {
                cluster.update(&ServerIdentity::new(&entry.host, entry.port), |s| {
                    s.read_only = true
                });
            }
        }
        Ok(cluster)
    }
}

impl LabCluster {
    /// 从拓扑文件构建
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        LabTopologyFile::load_from_file(path)?.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TOPOLOGY: &str = r#"
rpl_user = "repl:secret"

[[servers]]
host = "db1"
transactions = 3

[[servers]]
host = "db2"
master = "db1:3306"

[[servers]]
host = "db3"
port = 3307
master = "db1"
alive = false

[[tables]]
database = "shop"
name = "orders"
rows = 2
"#;

    #[test]
    fn test_build_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TOPOLOGY.as_bytes()).unwrap();

        let cluster = LabCluster::from_file(file.path()).unwrap();
        let db1 = cluster.server(&ServerIdentity::new("db1", 3306)).unwrap();
        let db2 = cluster.server(&ServerIdentity::new("db2", 3306)).unwrap();
        let db3 = cluster.server(&ServerIdentity::new("db3", 3307)).unwrap();

        assert_eq!(db1.executed.count(), 5);
        assert_eq!(db2.executed, db1.executed);
        assert_eq!(db2.replica_status().unwrap().master_user, "repl");
        assert!(!db3.alive);
        assert!(db3.tables.contains_key("shop"));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("db1:3307"), ServerIdentity::new("db1", 3307));
        assert_eq!(parse_host_port("db1"), ServerIdentity::new("db1", 3306));
    }
}
