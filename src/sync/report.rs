//! 一致性校验结果

use crate::server::ServerIdentity;
use std::fmt;

/// 单条校验结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFinding {
    /// 成员上有、基准服务器上没有的库
    DatabasesNotOnBase {
        server: ServerIdentity,
        databases: Vec<String>,
    },
    DatabaseMissing {
        server: ServerIdentity,
        database: String,
    },
    /// 成员上有、基准服务器上没有的表
    TablesNotOnBase {
        server: ServerIdentity,
        database: String,
        tables: Vec<String>,
    },
    TableMissing {
        server: ServerIdentity,
        database: String,
        table: String,
    },
    DefinitionDiffers {
        server: ServerIdentity,
        database: String,
        table: String,
    },
    ChecksumDiffers {
        server: ServerIdentity,
        database: String,
        table: String,
    },
    ChecksumMatches {
        server: ServerIdentity,
        database: String,
        table: String,
    },
    /// 跳过 (过滤规则、超时、校验失败)；server 为空表示对所有成员跳过
    Skipped {
        server: Option<ServerIdentity>,
        object: String,
        reason: String,
    },
}

impl SyncFinding {
    /// 计入的问题数
    pub fn issues(&self) -> usize {
        match self {
            SyncFinding::DatabasesNotOnBase { databases, .. } => databases.len(),
            SyncFinding::TablesNotOnBase { tables, .. } => tables.len(),
            SyncFinding::DatabaseMissing { .. }
            | SyncFinding::TableMissing { .. }
            | SyncFinding::DefinitionDiffers { .. }
            | SyncFinding::ChecksumDiffers { .. } => 1,
            SyncFinding::ChecksumMatches { .. } | SyncFinding::Skipped { .. } => 0,
        }
    }

    pub fn server(&self) -> Option<&ServerIdentity> {
        match self {
            SyncFinding::DatabasesNotOnBase { server, .. }
            | SyncFinding::DatabaseMissing { server, .. }
            | SyncFinding::TablesNotOnBase { server, .. }
            | SyncFinding::TableMissing { server, .. }
            | SyncFinding::DefinitionDiffers { server, .. }
            | SyncFinding::ChecksumDiffers { server, .. }
            | SyncFinding::ChecksumMatches { server, .. } => Some(server),
            SyncFinding::Skipped { server, .. } => server.as_ref(),
        }
    }

    /// 是否为校验和比对结果 (一致、不一致或跳过校验)
    pub fn is_checksum(&self) -> bool {
        match self {
            SyncFinding::ChecksumDiffers { .. } | SyncFinding::ChecksumMatches { .. } => true,
            SyncFinding::Skipped { object, .. } => object.ends_with(" checksum"),
            _ => false,
        }
    }
}

impl fmt::Display for SyncFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = |n: usize| if n > 1 { "s" } else { "" };
        match self {
            SyncFinding::DatabasesNotOnBase { server, databases } => write!(
                f,
                "[DIFF] Database{} NOT on base server but found on '{}': {}",
                plural(databases.len()),
                server,
                databases.join(",")
            ),
            SyncFinding::DatabaseMissing { server, database } => {
                write!(f, "[DIFF] Database '{}' NOT on server '{}'.", database, server)
            }
            SyncFinding::TablesNotOnBase {
                server,
                database,
                tables,
            } => write!(
                f,
                "[DIFF] Table{} NOT on base server but found on '{}': {}",
                plural(tables.len()),
                server,
                tables
                    .iter()
                    .map(|t| format!("`{}`.`{}`", database, t))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            SyncFinding::TableMissing {
                server,
                database,
                table,
            } => write!(
                f,
                "[DIFF] Table '{}.{}' NOT on server '{}'.",
                database, table, server
            ),
            SyncFinding::DefinitionDiffers {
                server,
                database,
                table,
            } => write!(
                f,
                "[DIFF] Table `{}`.`{}` definition is different on '{}'.",
                database, table, server
            ),
            SyncFinding::ChecksumDiffers {
                server,
                database,
                table,
            } => write!(
                f,
                "[DIFF] Table `{}`.`{}` checksum for server '{}'.",
                database, table, server
            ),
            SyncFinding::ChecksumMatches {
                server,
                database,
                table,
            } => write!(
                f,
                "[OK] `{}`.`{}` checksum for server '{}'.",
                database, table, server
            ),
            SyncFinding::Skipped {
                server: Some(server),
                object,
                reason,
            } => write!(f, "[SKIP] {} for '{}' - {}.", object, server, reason),
            SyncFinding::Skipped {
                server: None,
                object,
                reason,
            } => write!(f, "[SKIP] {} - {}.", object, reason),
        }
    }
}

/// 一次校验的完整报告
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub base: ServerIdentity,
    pub warnings: Vec<String>,
    pub findings: Vec<SyncFinding>,
}

impl SyncReport {
    pub fn new(base: ServerIdentity) -> Self {
        Self {
            base,
            warnings: Vec::new(),
            findings: Vec::new(),
        }
    }

    pub fn push(&mut self, finding: SyncFinding) {
        match &finding {
            SyncFinding::ChecksumMatches { .. } => log::info!("{}", finding),
            SyncFinding::Skipped { .. } => log::info!("{}", finding),
            _ => log::warn!("{}", finding),
        }
        self.findings.push(finding);
    }

    pub fn issue_count(&self) -> usize {
        self.findings.iter().map(SyncFinding::issues).sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.issue_count() == 0
    }

    /// 与某个成员相关的结论
    pub fn findings_for<'a>(&'a self, server: &'a ServerIdentity) -> impl Iterator<Item = &'a SyncFinding> {
        self.findings
            .iter()
            .filter(move |f| f.server().map(|s| s.same_server(server)).unwrap_or(false))
    }

    pub fn summary(&self) -> String {
        match self.issue_count() {
            0 => "SUMMARY: No data consistency issues found.".to_string(),
            1 => "SUMMARY: 1 data consistency issue found.".to_string(),
            n => format!("SUMMARY: {} data consistency issues found.", n),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Using '{}' as base server for comparison.\n", self.base));
        for warning in &self.warnings {
            out.push_str(&format!("# WARNING: {}\n", warning));
        }
        for finding in &self.findings {
            out.push_str(&format!("#   {}\n", finding));
        }
        out.push_str(&format!("# {}\n", self.summary()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_count_and_summary() {
        let r1 = ServerIdentity::new("r1", 3306);
        let mut report = SyncReport::new(ServerIdentity::new("p", 3306));
        assert_eq!(report.summary(), "SUMMARY: No data consistency issues found.");

        report.push(SyncFinding::TablesNotOnBase {
            server: r1.clone(),
            database: "shop".into(),
            tables: vec!["a".into(), "b".into()],
        });
        report.push(SyncFinding::ChecksumMatches {
            server: r1.clone(),
            database: "shop".into(),
            table: "orders".into(),
        });
        report.push(SyncFinding::Skipped {
            server: Some(r1.clone()),
            object: "Table `shop`.`log` checksum".into(),
            reason: "timeout catching up with master".into(),
        });

        assert_eq!(report.issue_count(), 2);
        assert_eq!(report.summary(), "SUMMARY: 2 data consistency issues found.");
        assert_eq!(report.findings_for(&r1).filter(|f| f.is_checksum()).count(), 2);

        let text = report.render();
        assert!(text.contains("[DIFF] Tables NOT on base server but found on 'r1:3306'"));
        assert!(text.contains("[SKIP] Table `shop`.`log` checksum for 'r1:3306' - timeout catching up with master."));
    }
}
