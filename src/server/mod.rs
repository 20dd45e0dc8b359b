//! 服务器连接边界
//!
//! - `ServerIdentity`: host + port，成员生命周期内不变
//! - `ConnectionSpec`: `user[:password]@host[:port]` 形式的连接串
//! - `ServerConnection` / `Connector`: 驱动层能力 (执行语句、重连、变量查询、状态读取)
//! - `PrimaryView` / `ReplicaView`: 同一连接句柄上按当前角色选择的两种只读能力视图

pub mod connection;
pub mod statement;
pub mod view;

pub use connection::{AdvertisedReplica, Connector, ServerConnection, ServerHandle, UserAccount};
pub use statement::Statement;
pub use view::{PrimaryView, ReplicaView};

use crate::replication::SslOptions;
use crate::{Result, RplError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// 默认端口
pub const DEFAULT_PORT: u16 = 3306;

/// 服务器身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub host: String,
    pub port: u16,
}

impl ServerIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: strip_brackets(&host.into()).to_string(),
            port,
        }
    }

    /// 比较用主机名：小写，回环地址统一为 localhost
    pub fn normalized_host(&self) -> String {
        let host = self.host.to_ascii_lowercase();
        match host.as_str() {
            "127.0.0.1" | "::1" | "localhost" => "localhost".to_string(),
            _ => host,
        }
    }

    /// 同一服务器 (主机别名 + 端口)
    pub fn same_server(&self, other: &ServerIdentity) -> bool {
        self.port == other.port && self.normalized_host() == other.normalized_host()
    }

    /// 主机部分是否为 IP 地址
    pub fn is_ip_address(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// 用户名 + 密码
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    pub fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

impl FromStr for Credentials {
    type Err = RplError;

    /// `user[:password]`
    fn from_str(s: &str) -> Result<Self> {
        let (user, password) = match s.split_once(':') {
            Some((u, p)) => (u, Some(p.to_string())),
            None => (s, None),
        };
        if user.is_empty() {
            return Err(RplError::InvalidParameter(format!(
                "user name missing in '{}', expected user[:password]",
                s
            )));
        }
        Ok(Credentials::new(user, password))
    }
}

/// 连接串
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub credentials: Credentials,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: SslOptions,
}

impl ConnectionSpec {
    pub fn new(credentials: Credentials, host: impl Into<String>, port: u16) -> Self {
        Self {
            credentials,
            host: strip_brackets(&host.into()).to_string(),
            port,
            ssl: SslOptions::default(),
        }
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::new(self.host.clone(), self.port)
    }

    /// 以新的身份复用本连接串的凭据 (用于发现的从库、候选提升)
    pub fn for_identity(&self, identity: &ServerIdentity) -> Self {
        Self {
            credentials: self.credentials.clone(),
            host: identity.host.clone(),
            port: identity.port,
            ssl: self.ssl.clone(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// 解析逗号分隔的连接串列表
    pub fn parse_list(text: &str) -> Result<Vec<ConnectionSpec>> {
        text.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ConnectionSpec::from_str)
            .collect()
    }
}

impl FromStr for ConnectionSpec {
    type Err = RplError;

    /// `user[:password]@host[:port]`，IPv6 主机需加方括号
    fn from_str(s: &str) -> Result<Self> {
        let (login, address) = s.rsplit_once('@').ok_or_else(|| {
            RplError::InvalidParameter(format!(
                "bad connection '{}', expected user[:password]@host[:port]",
                s
            ))
        })?;
        let credentials = Credentials::from_str(login)?;

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                RplError::InvalidParameter(format!("unterminated IPv6 address in '{}'", s))
            })?;
            match tail.strip_prefix(':') {
                Some(port) => (host, parse_port(port, s)?),
                None => (host, DEFAULT_PORT),
            }
        } else {
            match address.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port, s)?),
                None => (address, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(RplError::InvalidParameter(format!("host missing in '{}'", s)));
        }

        Ok(ConnectionSpec::new(credentials, host, port))
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.credentials.user, self.identity())
    }
}

fn parse_port(text: &str, whole: &str) -> Result<u16> {
    text.parse::<u16>()
        .map_err(|_| RplError::InvalidParameter(format!("bad port '{}' in '{}'", text, whole)))
}
