//! 复制过滤规则
//!
//! - 主库 binlog_do_db / binlog_ignore_db
//! - 从库 replicate_* (库级、表级、通配符表级)
//!
//! 通配符规则使用 SQL LIKE 语法，预编译为锚定的正则表达式。

use crate::server::ServerIdentity;
use crate::{Result, RplError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 从库 replicate_* 规则 (SHOW SLAVE STATUS 中的原始列表)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaFilterRules {
    #[serde(default)]
    pub do_db: Vec<String>,
    #[serde(default)]
    pub ignore_db: Vec<String>,
    #[serde(default)]
    pub do_table: Vec<String>,
    #[serde(default)]
    pub ignore_table: Vec<String>,
    #[serde(default)]
    pub wild_do_table: Vec<String>,
    #[serde(default)]
    pub wild_ignore_table: Vec<String>,
}

impl ReplicaFilterRules {
    pub fn is_empty(&self) -> bool {
        self.do_db.is_empty()
            && self.ignore_db.is_empty()
            && self.do_table.is_empty()
            && self.ignore_table.is_empty()
            && self.wild_do_table.is_empty()
            && self.wild_ignore_table.is_empty()
    }
}

/// 两组 binlog 过滤规则是否一致 (顺序无关)
pub fn binlog_filters_match(
    a_do: &[String],
    a_ignore: &[String],
    b_do: &[String],
    b_ignore: &[String],
) -> bool {
    fn as_set(list: &[String]) -> BTreeSet<&str> {
        list.iter().map(String::as_str).collect()
    }
    as_set(a_do) == as_set(b_do) && as_set(a_ignore) == as_set(b_ignore)
}

/// SQL LIKE 模式转为锚定正则
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => re.push_str(&regex::escape(&escaped.to_string())),
                None => re.push_str(&regex::escape("\\")),
            },
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|e| {
        RplError::InvalidParameter(format!("bad wildcard pattern '{}': {}", pattern, e))
    })
}

/// 一台服务器的过滤规则 (一次校验运行内只读取一次)
#[derive(Debug, Clone, Default)]
pub struct ReplicationFilterSet {
    /// 主库 binlog 规则
    pub binlog_do_db: Vec<String>,
    pub binlog_ignore_db: Vec<String>,

    /// 从库 replicate 规则
    pub rules: ReplicaFilterRules,
    wild_do: Vec<Regex>,
    wild_ignore: Vec<Regex>,
}

impl ReplicationFilterSet {
    /// 主库规则
    pub fn for_primary(binlog_do_db: Vec<String>, binlog_ignore_db: Vec<String>) -> Self {
        Self {
            binlog_do_db,
            binlog_ignore_db,
            ..Default::default()
        }
    }

    /// 从库规则；与 GTID 同步存在已知问题的规则直接拒绝
    pub fn for_replica(identity: &ServerIdentity, rules: ReplicaFilterRules) -> Result<Self> {
        let unsupported = [
            ("replicate_do_db", !rules.do_db.is_empty()),
            ("replicate_ignore_db", !rules.ignore_db.is_empty()),
            ("replicate_wild_do_table", !rules.wild_do_table.is_empty()),
        ];
        if let Some((name, _)) = unsupported.iter().find(|(_, used)| *used) {
            return Err(RplError::PrerequisiteError(format!(
                "Use of {} option is not supported. There is a known issue with the use \
                 of this replication filter and GTID for some server versions. \
                 Issue detected for '{}'.",
                name, identity
            )));
        }
        Self::compile(rules)
    }

    /// 不做支持性检查，直接编译规则
    pub fn compile(rules: ReplicaFilterRules) -> Result<Self> {
        let wild_do = rules
            .wild_do_table
            .iter()
            .map(|p| like_to_regex(p))
            .collect::<Result<Vec<_>>>()?;
        let wild_ignore = rules
            .wild_ignore_table
            .iter()
            .map(|p| like_to_regex(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            wild_do,
            wild_ignore,
            ..Default::default()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.binlog_do_db.is_empty() && self.binlog_ignore_db.is_empty() && self.rules.is_empty()
    }

    /// 库是否被过滤 (不复制)
    pub fn is_database_filtered(&self, db: &str) -> bool {
        if !self.binlog_do_db.is_empty() {
            return !self.binlog_do_db.iter().any(|d| d == db);
        }
        if self.binlog_ignore_db.iter().any(|d| d == db) {
            return true;
        }
        if !self.rules.do_db.is_empty() {
            return !self.rules.do_db.iter().any(|d| d == db);
        }
        self.rules.ignore_db.iter().any(|d| d == db)
    }

    /// 表是否被过滤 (不复制)
    pub fn is_table_filtered(&self, db: &str, table: &str) -> bool {
        let name = format!("{}.{}", db, table);

        if self.rules.do_table.iter().any(|t| *t == name) {
            return false;
        }
        if self.rules.ignore_table.iter().any(|t| *t == name) {
            return true;
        }
        if self.wild_do.iter().any(|re| re.is_match(&name)) {
            return false;
        }
        if self.wild_ignore.iter().any(|re| re.is_match(&name)) {
            return true;
        }
        // 存在白名单但未命中
        !self.rules.do_table.is_empty() || !self.rules.wild_do_table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_like_to_regex() {
        let re = like_to_regex("shop.order%").unwrap();
        assert!(re.is_match("shop.orders"));
        assert!(re.is_match("shop.order"));
        assert!(!re.is_match("shopXorders"));
        assert!(!re.is_match("old_shop.orders"));

        let re = like_to_regex("db_.t\\_1").unwrap();
        assert!(re.is_match("db1.t_1"));
        assert!(!re.is_match("db1.tx1"));
    }

    #[test]
    fn test_binlog_filters_match() {
        assert!(binlog_filters_match(&[], &[], &[], &[]));
        assert!(binlog_filters_match(
            &strings(&["a", "b"]),
            &[],
            &strings(&["b", "a"]),
            &[]
        ));
        assert!(!binlog_filters_match(&strings(&["a"]), &[], &[], &[]));
        assert!(!binlog_filters_match(&[], &strings(&["x"]), &[], &strings(&["y"])));
    }

    #[test]
    fn test_primary_database_filters() {
        let f = ReplicationFilterSet::for_primary(strings(&["shop"]), vec![]);
        assert!(!f.is_database_filtered("shop"));
        assert!(f.is_database_filtered("audit"));

        let f = ReplicationFilterSet::for_primary(vec![], strings(&["tmp"]));
        assert!(f.is_database_filtered("tmp"));
        assert!(!f.is_database_filtered("shop"));
    }

    #[test]
    fn test_replica_table_filters() {
        let rules = ReplicaFilterRules {
            ignore_table: strings(&["shop.cache"]),
            wild_ignore_table: strings(&["shop.tmp%"]),
            ..Default::default()
        };
        let f = ReplicationFilterSet::for_replica(&ServerIdentity::new("r1", 3306), rules).unwrap();
        assert!(f.is_table_filtered("shop", "cache"));
        assert!(f.is_table_filtered("shop", "tmp_2024"));
        assert!(!f.is_table_filtered("shop", "orders"));

        let rules = ReplicaFilterRules {
            do_table: strings(&["shop.orders"]),
            ..Default::default()
        };
        let f = ReplicationFilterSet::compile(rules).unwrap();
        assert!(!f.is_table_filtered("shop", "orders"));
        assert!(f.is_table_filtered("shop", "users"));
    }

    #[test]
    fn test_unsupported_replica_rules() {
        let rules = ReplicaFilterRules {
            do_db: strings(&["shop"]),
            ..Default::default()
        };
        let err = ReplicationFilterSet::for_replica(&ServerIdentity::new("r1", 3306), rules)
            .unwrap_err();
        assert!(err.to_string().contains("replicate_do_db"));
    }
}
