//! GTID 集合
//!
//! 以服务器 UUID 为键、闭区间列表为值的值类型。
//! 所有运算返回新集合，不在原地修改。
//!
//! 文本格式与服务器一致：
//! ```text
//! 3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:11-18,
//! 8ae2d5c4-71ca-11e1-9e33-c80aa9429562:1-3
//! ```

use crate::{Result, RplError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 闭区间 [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// 区间内事务数
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, n: u64) -> bool {
        self.start <= n && n <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// GTID 集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GtidSet {
    /// uuid(小写) -> 有序且不相邻的区间
    sets: BTreeMap<String, Vec<Interval>>,
}

impl GtidSet {
    /// 空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析文本格式，空串为空集合
    pub fn parse(text: &str) -> Result<Self> {
        let mut sets: BTreeMap<String, Vec<Interval>> = BTreeMap::new();

        for segment in text.split(',') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }

            let mut parts = segment.split(':');
            let uuid = parts
                .next()
                .map(str::trim)
                .ok_or_else(|| RplError::GtidError(segment.to_string()))?;
            let uuid = normalize_uuid(uuid)?;

            let mut intervals = Vec::new();
            for part in parts {
                intervals.push(parse_interval(part.trim(), segment)?);
            }
            if intervals.is_empty() {
                return Err(RplError::GtidError(format!(
                    "missing transaction interval in '{}'",
                    segment
                )));
            }

            sets.entry(uuid).or_default().extend(intervals);
        }

        for intervals in sets.values_mut() {
            normalize(intervals);
        }

        Ok(Self { sets })
    }

    /// 单个 UUID 的连续区间
    pub fn from_range(uuid: &str, start: u64, end: u64) -> Result<Self> {
        if start == 0 || end < start {
            return Err(RplError::GtidError(format!(
                "invalid interval {}-{} for {}",
                start, end, uuid
            )));
        }
        let mut sets = BTreeMap::new();
        sets.insert(normalize_uuid(uuid)?, vec![Interval::new(start, end)]);
        Ok(Self { sets })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// 集合基数 (事务总数)，超出 u64 时取 u64::MAX
    pub fn count(&self) -> u64 {
        self.sets
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(Interval::len)
            .fold(0u64, u64::saturating_add)
    }

    /// 集合中出现的 UUID
    pub fn uuids(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    pub fn intervals(&self, uuid: &str) -> &[Interval] {
        self.sets
            .get(&uuid.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, uuid: &str, transaction: u64) -> bool {
        self.intervals(uuid).iter().any(|iv| iv.contains(transaction))
    }

    /// 并集
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut sets = self.sets.clone();
        for (uuid, intervals) in &other.sets {
            sets.entry(uuid.clone())
                .or_default()
                .extend(intervals.iter().copied());
        }
        for intervals in sets.values_mut() {
            normalize(intervals);
        }
        GtidSet { sets }
    }

    /// 差集 self - other
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut sets = BTreeMap::new();
        for (uuid, intervals) in &self.sets {
            let remaining = match other.sets.get(uuid) {
                Some(cuts) => subtract_intervals(intervals, cuts),
                None => intervals.clone(),
            };
            if !remaining.is_empty() {
                sets.insert(uuid.clone(), remaining);
            }
        }
        GtidSet { sets }
    }

    /// 交集
    pub fn intersection(&self, other: &GtidSet) -> GtidSet {
        let mut sets = BTreeMap::new();
        for (uuid, intervals) in &self.sets {
            if let Some(theirs) = other.sets.get(uuid) {
                let common = intersect_intervals(intervals, theirs);
                if !common.is_empty() {
                    sets.insert(uuid.clone(), common);
                }
            }
        }
        GtidSet { sets }
    }

    /// self ⊆ other
    pub fn is_subset(&self, other: &GtidSet) -> bool {
        self.subtract(other).is_empty()
    }

    /// 某个 UUID 的最大事务号
    pub fn last_transaction(&self, uuid: &str) -> Option<u64> {
        self.intervals(uuid).last().map(|iv| iv.end)
    }

    /// 仅包含该 UUID 最后一个事务的集合 (同步点)
    pub fn last_of(&self, uuid: &str) -> GtidSet {
        match (self.last_transaction(uuid), normalize_uuid(uuid)) {
            (Some(last), Ok(key)) => {
                let mut sets = BTreeMap::new();
                sets.insert(key, vec![Interval::new(last, last)]);
                GtidSet { sets }
            }
            _ => GtidSet::new(),
        }
    }

    /// 去掉某个 UUID 的全部事务 (大小写不敏感)
    pub fn without_uuid(&self, uuid: &str) -> GtidSet {
        let key = uuid.to_ascii_lowercase();
        let mut sets = self.sets.clone();
        sets.remove(&key);
        GtidSet { sets }
    }

    /// 仅保留某个 UUID 的事务
    pub fn only_uuid(&self, uuid: &str) -> GtidSet {
        let key = uuid.to_ascii_lowercase();
        let mut sets = BTreeMap::new();
        if let Some(intervals) = self.sets.get(&key) {
            sets.insert(key, intervals.clone());
        }
        GtidSet { sets }
    }

    /// 按 UUID 拆分为单 UUID 集合
    pub fn split_by_uuid(&self) -> Vec<GtidSet> {
        self.sets
            .keys()
            .map(|uuid| self.only_uuid(uuid))
            .collect()
    }
}

fn normalize_uuid(uuid: &str) -> Result<String> {
    uuid::Uuid::parse_str(uuid)
        .map(|u| u.hyphenated().to_string())
        .map_err(|e| RplError::GtidError(format!("bad server uuid '{}': {}", uuid, e)))
}

fn parse_interval(text: &str, segment: &str) -> Result<Interval> {
    let bad = || RplError::GtidError(format!("bad interval '{}' in '{}'", text, segment));

    let (start, end) = match text.split_once('-') {
        Some((a, b)) => (
            a.trim().parse::<u64>().map_err(|_| bad())?,
            b.trim().parse::<u64>().map_err(|_| bad())?,
        ),
        None => {
            let n = text.parse::<u64>().map_err(|_| bad())?;
            (n, n)
        }
    };

    if start == 0 || end < start {
        return Err(bad());
    }
    Ok(Interval::new(start, end))
}

/// 排序并合并重叠/相邻区间
fn normalize(intervals: &mut Vec<Interval>) {
    if intervals.len() < 2 {
        return;
    }
    intervals.sort();

    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

fn subtract_intervals(ours: &[Interval], cuts: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();

    for iv in ours {
        let mut start = Some(iv.start);
        for cut in cuts {
            let s = match start {
                Some(s) => s,
                None => break,
            };
            if cut.end < s {
                continue;
            }
            if cut.start > iv.end {
                break;
            }
            if cut.start > s {
                out.push(Interval::new(s, cut.start - 1));
            }
            start = cut.end.checked_add(1).filter(|next| *next <= iv.end);
        }
        if let Some(s) = start {
            out.push(Interval::new(s, iv.end));
        }
    }

    out
}

fn intersect_intervals(a: &[Interval], b: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if start <= end {
            out.push(Interval::new(start, end));
        }
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }

    out
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.sets {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for iv in intervals {
                write!(f, ":{}", iv)?;
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = RplError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        GtidSet::parse(&text).map_err(serde::de::Error::custom)
    }
}
