//! 校验范围与版本解析

use crate::{Result, RplError};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// 同步校验要求的最低版本 (START SLAVE UNTIL SQL_AFTER_GTIDS)
pub const MIN_SYNC_VERSION: (u32, u32, u32) = (5, 6, 14);

/// 解析 `5.7.30-log` 形式的版本号，缺省的发布号按 0 处理
pub fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let numeric: String = text
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let release = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    Some((major, minor, release))
}

/// 去掉不影响结构的表选项 (AUTO_INCREMENT 计数)
pub fn normalize_definition(definition: &str) -> String {
    lazy_static::lazy_static! {
        static ref AUTO_INCREMENT: Regex =
            Regex::new(r"(?i)\s*AUTO_INCREMENT=\d+").expect("valid AUTO_INCREMENT pattern");
    }
    AUTO_INCREMENT.replace_all(definition.trim(), "").to_string()
}

/// include / exclude 列表，元素为 `db` 或 `db.table`
///
/// 表集合为空表示整个库。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSelection {
    include: BTreeMap<String, BTreeSet<String>>,
    exclude: BTreeMap<String, BTreeSet<String>>,
}

fn parse_entries(entries: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let entry = entry.replace('`', "");
        match entry.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => {
                map.entry(db.to_string()).or_default().insert(table.to_string());
            }
            Some(_) => {
                return Err(RplError::InvalidParameter(format!(
                    "bad object name '{}', expected db or db.table",
                    entry
                )))
            }
            None => {
                map.entry(entry.to_string()).or_default();
            }
        }
    }
    Ok(map)
}

impl ObjectSelection {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: parse_entries(include)?,
            exclude: parse_entries(exclude)?,
        })
    }

    /// 库是否在检查范围内
    pub fn includes_database(&self, db: &str) -> bool {
        if !self.include.is_empty() && !self.include.contains_key(db) {
            return false;
        }
        !self.exclude.get(db).map(|t| t.is_empty()).unwrap_or(false)
    }

    /// 表是否在检查范围内 (库已选中的前提下)
    pub fn includes_table(&self, db: &str, table: &str) -> bool {
        if let Some(tables) = self.include.get(db) {
            if !tables.is_empty() && !tables.contains(table) {
                return false;
            }
        }
        match self.exclude.get(db) {
            Some(tables) if !tables.is_empty() => !tables.contains(table),
            Some(_) => false,
            None => true,
        }
    }

    /// include 中列出的库
    pub fn included_databases(&self) -> impl Iterator<Item = &str> {
        self.include.keys().map(String::as_str)
    }
}
