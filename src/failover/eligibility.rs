//! 候选从库资格检查
//!
//! 固定顺序的流水线，遇到第一个失败项即返回：
//!
//! | 检查 | 条件 |
//! |------|------|
//! | CONNECTED | 存活，且 (需要时) 上游是当前主库 |
//! | GTID | 主库 GTID_MODE=ON 时候选也必须为 ON |
//! | BEHIND | 非 GTID：不落后于主库位点 |
//! | FILTERS | binlog 过滤规则与主库一致 (force 时降级为警告) |
//! | BINLOG | 非 GTID：候选开启 binlog |
//! | RPL_USER | 候选上存在复制账号 (force 时降级为警告) |

use crate::server::view::gtid_mode;
use crate::server::{ConnectionSpec, Credentials, PrimaryView, ReplicaView};
use crate::topology::health::binlog_filters_agree;
use crate::topology::{ReplicaRecord, TopologyRegistry};
use crate::Result;
use std::fmt;

/// 检查项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckName {
    Connected,
    Gtid,
    Behind,
    Filters,
    Binlog,
    RplUser,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckName::Connected => "CONNECTED",
            CheckName::Gtid => "GTID",
            CheckName::Behind => "BEHIND",
            CheckName::Filters => "FILTERS",
            CheckName::Binlog => "BINLOG",
            CheckName::RplUser => "RPL_USER",
        };
        write!(f, "{}", name)
    }
}

/// 检查结果 (不是错误)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityResult {
    pub eligible: bool,
    pub failed_check: Option<CheckName>,
    pub detail: String,
    /// force 降级得到的警告
    pub warnings: Vec<String>,
}

impl EligibilityResult {
    fn pass(warnings: Vec<String>) -> Self {
        Self {
            eligible: true,
            failed_check: None,
            detail: String::new(),
            warnings,
        }
    }

    fn fail(check: CheckName, detail: impl Into<String>) -> Self {
        Self {
            eligible: false,
            failed_check: Some(check),
            detail: detail.into(),
            warnings: Vec::new(),
        }
    }
}

/// 资格检查器
#[derive(Debug, Clone, Default)]
pub struct EligibilityChecker {
    force: bool,
    /// 显式指定的复制账号，候选上无法推导账号时使用
    rpl_user: Option<Credentials>,
}

impl EligibilityChecker {
    pub fn new(force: bool, rpl_user: Option<Credentials>) -> Self {
        Self { force, rpl_user }
    }

    pub fn force(&self) -> bool {
        self.force
    }

    /// 候选使用的复制账号：候选自身记录的账号优先，其次为显式账号
    pub async fn replication_user(&self, candidate: &ReplicaView) -> Result<Option<Credentials>> {
        match candidate.replication_user().await? {
            Some(user) => Ok(Some(user)),
            None => Ok(self.rpl_user.clone()),
        }
    }

    /// 逐项检查候选
    pub async fn check_candidate(
        &self,
        primary: Option<&PrimaryView>,
        candidate: &ReplicaView,
        check_against_primary: bool,
    ) -> Result<EligibilityResult> {
        let identity = candidate.identity();
        log::debug!("[{}] Checking eligibility of slave for candidate", identity);

        if !candidate.is_alive().await {
            return Ok(EligibilityResult::fail(
                CheckName::Connected,
                "Connection to slave server lost.",
            ));
        }

        // 主库不可达时以候选自身的 GTID_MODE 为准
        let live_primary = match primary {
            Some(p) if p.is_alive().await => Some(p),
            _ => None,
        };
        let gtid_on = match live_primary {
            Some(p) => p.gtid_enabled().await?,
            None => candidate.gtid_enabled().await?,
        };

        if check_against_primary {
            let configured = match primary {
                Some(p) => candidate.is_configured_for(&p.identity()).await?,
                None => false,
            };
            if !configured {
                return Ok(EligibilityResult::fail(
                    CheckName::Connected,
                    "Candidate is not connected to the correct master.",
                ));
            }
        }

        if gtid_on && gtid_mode(candidate.handle()).await? != "ON" {
            return Ok(EligibilityResult::fail(
                CheckName::Gtid,
                "Slave does not have GTID support enabled.",
            ));
        }

        if !gtid_on && check_against_primary {
            if let Some(p) = live_primary {
                let errors = self.replica_delay(p, candidate).await?;
                if !errors.is_empty() {
                    return Ok(EligibilityResult::fail(CheckName::Behind, errors.join(" ")));
                }
            }
        }

        let mut warnings = Vec::new();
        if check_against_primary {
            if let Some(p) = live_primary {
                if !binlog_filters_agree(p, &candidate.as_primary()).await? {
                    if !self.force {
                        return Ok(EligibilityResult::fail(
                            CheckName::Filters,
                            "Master and slave filters differ.",
                        ));
                    }
                    // force 跳过该检查，差异仍需报告
                    let msg = format!("[{}] Master and candidate binary log filters differ.", identity);
                    log::warn!("{}", msg);
                    warnings.push(msg);
                }
            }
        }

        if !gtid_on && !candidate.binlog_enabled().await? {
            return Ok(EligibilityResult::fail(
                CheckName::Binlog,
                "Binary logging is not enabled on the candidate.",
            ));
        }

        let user = self.replication_user(candidate).await?;
        let user_ok = match &user {
            Some(user) => candidate.as_primary().has_replication_user(&user.user).await?,
            None => false,
        };
        if !user_ok {
            if !self.force {
                return Ok(EligibilityResult::fail(
                    CheckName::RplUser,
                    "Candidate slave is missing replication user.",
                ));
            }
            let msg = "Replication user not found but --force used.".to_string();
            log::warn!("[{}] {}", identity, msg);
            warnings.push(msg);
        }

        Ok(EligibilityResult::pass(warnings))
    }

    /// 非 GTID 拓扑下候选相对主库的落后情况
    async fn replica_delay(&self, primary: &PrimaryView, candidate: &ReplicaView) -> Result<Vec<String>> {
        let master = match primary.status().await? {
            Some(status) => status,
            None => return Ok(vec!["Cannot read master status.".to_string()]),
        };
        let status = match candidate.status().await? {
            Some(status) => status,
            None => {
                return Ok(vec![
                    "The server specified as the slave is not configured as a replication slave."
                        .to_string(),
                ])
            }
        };
        if !status.io_running() {
            return Ok(vec!["Slave is stopped.".to_string()]);
        }

        let mut errors = Vec::new();
        match status.seconds_behind {
            Some(0) | None => {
                if status.master_log_file != master.log_file
                    || status.read_master_log_pos != master.log_position
                {
                    errors.push("Slave is behind master.".to_string());
                    errors.push(format!("Master binary log file = {}", master.log_file));
                    errors.push(format!("Master binary log position = {}", master.log_position));
                    errors.push(format!(
                        "Slave is reading master binary log file = {}",
                        status.master_log_file
                    ));
                    errors.push(format!(
                        "Slave is reading master binary log position = {}",
                        status.read_master_log_pos
                    ));
                }
            }
            Some(seconds) => errors.push(format!("Slave is {} seconds behind master.", seconds)),
        }
        Ok(errors)
    }

    /// 选出第一个合格的候选
    ///
    /// 先按给定顺序检查候选，都不合格时 strict 返回 None，
    /// 否则再按注册表顺序扫描所有从库。评估出错的服务器视为不合格。
    pub async fn find_best(
        &self,
        registry: &TopologyRegistry,
        candidates: &[ConnectionSpec],
        check_against_primary: bool,
        strict: bool,
    ) -> Result<Option<ReplicaRecord>> {
        let primary = registry.primary().map(|p| p.view.clone());

        for spec in candidates {
            let handle = match registry.connect_candidate(spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    log::warn!("[{}] Candidate unreachable: {}", spec.identity(), e);
                    continue;
                }
            };
            let view = ReplicaView::new(handle.clone());
            if !view.is_alive().await {
                continue;
            }
            match self.check_candidate(primary.as_ref(), &view, check_against_primary).await {
                Ok(result) if result.eligible => {
                    return Ok(Some(ReplicaRecord {
                        identity: handle.identity(),
                        spec: spec.clone(),
                        handle: Some(handle),
                        discovered: false,
                    }))
                }
                Ok(result) => log::warn!(
                    "[{}] Candidate does not meet the requirements: {} ({})",
                    spec.identity(),
                    result.detail,
                    result.failed_check.map(|c| c.to_string()).unwrap_or_default()
                ),
                Err(e) => log::warn!("[{}] Candidate eliminated due to error: {}", spec.identity(), e),
            }
        }

        if strict {
            log::error!("None of the candidates was the best slave.");
            return Ok(None);
        }
        if !candidates.is_empty() {
            log::warn!("None of the candidates was the best slave.");
        }

        for record in registry.replicas() {
            let view = match record.live_view().await {
                Some(view) => view,
                None => continue,
            };
            match self.check_candidate(primary.as_ref(), &view, check_against_primary).await {
                Ok(result) if result.eligible => return Ok(Some(record.clone())),
                Ok(result) => log::info!(
                    "[{}] Slave not eligible: {} ({})",
                    record.identity,
                    result.detail,
                    result.failed_check.map(|c| c.to_string()).unwrap_or_default()
                ),
                Err(e) => log::warn!("[{}] Slave eliminated due to error: {}", record.identity, e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::MockServerConnection;
    use crate::server::{ServerHandle, ServerIdentity};
    use crate::topology::test_support::*;
    use std::sync::Arc;

    fn mock_with_gtid(host: &str, mode: &'static str) -> ServerHandle {
        let mut mock = MockServerConnection::new();
        let identity = ServerIdentity::new(host, 3306);
        mock.expect_identity().returning(move || identity.clone());
        mock.expect_is_alive().returning(|| true);
        mock.expect_variable()
            .withf(|name| name == "gtid_mode")
            .returning(move |_| Ok(Some(mode.to_string())));
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_gtid_mismatch_fails_gtid_check() {
        let primary = PrimaryView::new(mock_with_gtid("p", "ON"));
        let candidate = ReplicaView::new(mock_with_gtid("c", "OFF"));

        let result = EligibilityChecker::default()
            .check_candidate(Some(&primary), &candidate, false)
            .await
            .unwrap();
        assert!(!result.eligible);
        assert_eq!(result.failed_check, Some(CheckName::Gtid));
        assert_eq!(result.detail, "Slave does not have GTID support enabled.");
    }

    #[tokio::test]
    async fn test_dead_candidate_fails_connected_check_first() {
        let mut dead = MockServerConnection::new();
        dead.expect_identity()
            .returning(|| ServerIdentity::new("c", 3306));
        dead.expect_is_alive().returning(|| false);
        let candidate = ReplicaView::new(Arc::new(dead));
        let primary = PrimaryView::new(mock_with_gtid("p", "ON"));

        // 不与主库比较时同样先检查存活，不再读取 GTID_MODE
        for against_primary in [false, true] {
            let result = EligibilityChecker::new(true, None)
                .check_candidate(Some(&primary), &candidate, against_primary)
                .await
                .unwrap();
            assert!(!result.eligible);
            assert_eq!(result.failed_check, Some(CheckName::Connected));
            assert_eq!(result.detail, "Connection to slave server lost.");
        }
    }

    #[tokio::test]
    async fn test_caught_up_replica_is_eligible() {
        let cluster = star("p", &["r1"], 3);
        let registry = registry(&cluster, Some("p"), &["r1"]).await;
        let primary = registry.primary().unwrap().view.clone();
        let view = registry.replicas()[0].view().unwrap();

        let result = EligibilityChecker::default()
            .check_candidate(Some(&primary), &view, true)
            .await
            .unwrap();
        assert!(result.eligible, "{:?}", result);
    }

    #[tokio::test]
    async fn test_wrong_upstream_fails_connected_check() {
        let cluster = star("p", &["r1"], 1);
        cluster.add_server(crate::lab::LabServer::new("q", 3306, 9));
        cluster
            .attach(&ServerIdentity::new("r1", 3306), &ServerIdentity::new("q", 3306), &rpl())
            .unwrap();
        let registry = registry(&cluster, Some("p"), &["r1"]).await;
        let primary = registry.primary().unwrap().view.clone();
        let view = registry.replicas()[0].view().unwrap();

        let result = EligibilityChecker::default()
            .check_candidate(Some(&primary), &view, true)
            .await
            .unwrap();
        assert_eq!(result.failed_check, Some(CheckName::Connected));
        assert_eq!(result.detail, "Candidate is not connected to the correct master.");
    }

    #[tokio::test]
    async fn test_force_never_makes_candidate_ineligible() {
        let cluster = star("p", &["r1"], 2);
        let r1 = ServerIdentity::new("r1", 3306);
        cluster.update(&r1, |s| s.binlog_do_db = vec!["shop".into()]);
        let registry = registry(&cluster, Some("p"), &["r1"]).await;
        let primary = registry.primary().unwrap().view.clone();
        let view = registry.replicas()[0].view().unwrap();

        let strict = EligibilityChecker::new(false, None)
            .check_candidate(Some(&primary), &view, true)
            .await
            .unwrap();
        assert_eq!(strict.failed_check, Some(CheckName::Filters));

        let forced = EligibilityChecker::new(true, None)
            .check_candidate(Some(&primary), &view, true)
            .await
            .unwrap();
        assert!(forced.eligible);
        assert_eq!(
            forced.warnings,
            vec!["[r1:3306] Master and candidate binary log filters differ.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_replication_user() {
        let cluster = star("p", &["r1"], 1);
        let r1 = ServerIdentity::new("r1", 3306);
        cluster.update(&r1, |s| s.users.retain(|u| u.account.user != "rpl"));
        let registry = registry(&cluster, Some("p"), &["r1"]).await;
        let primary = registry.primary().unwrap().view.clone();
        let view = registry.replicas()[0].view().unwrap();

        let result = EligibilityChecker::new(false, None)
            .check_candidate(Some(&primary), &view, true)
            .await
            .unwrap();
        assert_eq!(result.failed_check, Some(CheckName::RplUser));

        let forced = EligibilityChecker::new(true, Some(rpl()))
            .check_candidate(Some(&primary), &view, true)
            .await
            .unwrap();
        assert!(forced.eligible);
        assert_eq!(forced.warnings, vec!["Replication user not found but --force used.".to_string()]);
    }

    #[tokio::test]
    async fn test_find_best_prefers_candidates_then_registry_order() {
        let cluster = star("p", &["r1", "r2"], 2);
        let r1 = ServerIdentity::new("r1", 3306);
        cluster.update(&r1, |s| s.gtid_mode = false);
        let registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        let checker = EligibilityChecker::default();

        // r1 GTID 关闭，r2 胜出
        let best = checker.find_best(&registry, &[], true, false).await.unwrap().unwrap();
        assert_eq!(best.identity.host, "r2");

        let best = checker
            .find_best(&registry, &[spec("r2")], true, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.identity.host, "r2");

        assert!(checker.find_best(&registry, &[spec("r1")], true, true).await.unwrap().is_none());
    }
}
