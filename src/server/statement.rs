//! 变更语句

use super::UserAccount;
use crate::gtid::GtidSet;
use crate::replication::ChangeMasterCommand;
use std::fmt;

/// 核心会下发的全部变更语句
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// 重指向上游
    ChangeMaster(ChangeMasterCommand),

    StartReplica,
    StopReplica,
    StartSqlThread,
    StopSqlThread,

    /// 到达 GTID 集合后停止 SQL 线程
    StartSqlThreadUntil(GtidSet),

    ResetReplica,

    /// 清除全部复制配置 (新主库忘记上游)
    ResetReplicaAll,

    FlushTablesWithReadLock,

    /// 表级读锁，元素为 (库, 表)
    LockTablesRead(Vec<(String, String)>),

    UnlockTables,

    SetReadOnly(bool),

    CreateUser {
        account: UserAccount,
        password: String,
    },

    GrantReplication(UserAccount),
}

impl Statement {
    /// SQL 文本
    pub fn to_sql(&self) -> String {
        match self {
            Statement::ChangeMaster(cmd) => cmd.to_sql(),
            Statement::StartReplica => "START SLAVE".to_string(),
            Statement::StopReplica => "STOP SLAVE".to_string(),
            Statement::StartSqlThread => "START SLAVE SQL_THREAD".to_string(),
            Statement::StopSqlThread => "STOP SLAVE SQL_THREAD".to_string(),
            Statement::StartSqlThreadUntil(gtids) => format!(
                "START SLAVE SQL_THREAD UNTIL SQL_AFTER_GTIDS = '{}'",
                gtids
            ),
            Statement::ResetReplica => "RESET SLAVE".to_string(),
            Statement::ResetReplicaAll => "RESET SLAVE ALL".to_string(),
            Statement::FlushTablesWithReadLock => "FLUSH TABLES WITH READ LOCK".to_string(),
            Statement::LockTablesRead(tables) => {
                let list: Vec<String> = tables
                    .iter()
                    .map(|(db, tbl)| format!("{}.{} READ", quote_identifier(db), quote_identifier(tbl)))
                    .collect();
                format!("LOCK TABLES {}", list.join(", "))
            }
            Statement::UnlockTables => "UNLOCK TABLES".to_string(),
            Statement::SetReadOnly(on) => format!(
                "SET @@GLOBAL.READ_ONLY = {}",
                if *on { "ON" } else { "OFF" }
            ),
            Statement::CreateUser { account, password } => format!(
                "CREATE USER {} IDENTIFIED BY '{}'",
                account,
                escape_literal(password)
            ),
            Statement::GrantReplication(account) => {
                format!("GRANT REPLICATION SLAVE ON *.* TO {}", account)
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 不在日志中输出密码
        match self {
            Statement::CreateUser { account, .. } => {
                write!(f, "CREATE USER {} IDENTIFIED BY '****'", account)
            }
            Statement::ChangeMaster(cmd) => write!(f, "{}", cmd.to_masked_sql()),
            other => write!(f, "{}", other.to_sql()),
        }
    }
}

/// 反引号标识符
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// 单引号字面量内转义
pub fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
