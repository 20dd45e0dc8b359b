//! 错误事务检测
//!
//! 某从库独有、其余可达从库都没有、且不是当前主库产生的事务。

use super::{fan_out, partition_results, TopologyRegistry};
use crate::gtid::GtidSet;
use crate::observability::ERRANT_TRANSACTIONS;
use crate::server::ServerIdentity;
use crate::Result;

/// 单个从库上的错误事务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrantFinding {
    pub identity: ServerIdentity,
    pub gtids: GtidSet,
}

/// 在其他从库的 executed 集合中都不存在的部分
///
/// 没有其他从库可比较时结果为空。
pub fn errant_against(own: &GtidSet, primary_uuid: &str, others: &[&GtidSet]) -> GtidSet {
    if others.is_empty() {
        return GtidSet::new();
    }
    let mut errant = own.without_uuid(primary_uuid);
    for other in others {
        if errant.is_empty() {
            break;
        }
        errant = errant.subtract(other);
    }
    errant
}

impl TopologyRegistry {
    /// 主库 UUID；主库不可达时取自从库记录的上游 UUID
    async fn primary_uuid(&self) -> Result<Option<String>> {
        if let Some(primary) = self.primary() {
            if primary.view.is_alive().await {
                return Ok(Some(primary.view.uuid().await?));
            }
        }
        for (_, view) in self.live_replicas().await {
            if let Some(status) = view.status().await? {
                if !status.master_uuid.is_empty() {
                    return Ok(Some(status.master_uuid));
                }
            }
        }
        Ok(None)
    }

    /// 查找所有可达从库上的错误事务
    pub async fn find_errant_transactions(&self) -> Result<Vec<ErrantFinding>> {
        let primary_uuid = self.primary_uuid().await?.unwrap_or_default();

        let results = fan_out(self.live_replicas().await, None, |view| async move {
            view.gtid_executed().await
        })
        .await;
        let (executed, _) = partition_results(results);

        let mut findings = Vec::new();
        for (index, (identity, own)) in executed.iter().enumerate() {
            let others: Vec<&GtidSet> = executed
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, (_, set))| set)
                .collect();
            let errant = errant_against(own, &primary_uuid, &others);
            if !errant.is_empty() {
                log::warn!("[{}] Errant transactions found: {}", identity, errant);
                findings.push(ErrantFinding {
                    identity: identity.clone(),
                    gtids: errant,
                });
            }
        }

        let total: u64 = findings.iter().map(|f| f.gtids.count()).sum();
        ERRANT_TRANSACTIONS.set(total as i64);
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::test_support::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "4e11fa47-71ca-11e1-9e33-c80aa9429562";
    const P: &str = "5e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn test_errant_against_others() {
        let own = GtidSet::parse(&format!("{}:1-10,{}:1-3", P, A)).unwrap();
        let other = GtidSet::parse(&format!("{}:1-10,{}:1", P, A)).unwrap();
        let third = GtidSet::parse(&format!("{}:1-10,{}:1-2", P, B)).unwrap();

        let errant = errant_against(&own, P, &[&other, &third]);
        assert_eq!(errant.to_string(), format!("{}:2-3", A));
    }

    #[test]
    fn test_errant_needs_other_replicas() {
        let own = GtidSet::parse(&format!("{}:1-3", A)).unwrap();
        assert!(errant_against(&own, P, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_identical_replicas_have_no_errant_transactions() {
        let cluster = star("p", &["r1", "r2"], 6);
        let registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        assert!(registry.find_errant_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_write_on_replica_is_errant() {
        let cluster = star("p", &["r1", "r2"], 2);
        let r2 = crate::server::ServerIdentity::new("r2", 3306);
        let local = cluster.commit(&r2, 2).unwrap();
        let registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;

        let findings = registry.find_errant_transactions().await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].identity, r2);
        assert_eq!(findings[0].gtids, local);
    }
}
