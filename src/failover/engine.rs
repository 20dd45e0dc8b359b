//! switchover / failover 流程
//!
//! 两个流程共用同一状态机。前置检查全部在写屏蔽之前完成，失败时拓扑不变；
//! 进入变更窗口 (PrimaryFenced 之后) 的失败只报告，不回滚。

use super::eligibility::EligibilityChecker;
use super::hooks::RoleChangeHooks;
use super::state::{FailoverState, StateTracker};
use crate::gtid::GtidSet;
use crate::observability::RoleChangeTimer;
use crate::replication::SslOptions;
use crate::server::{ConnectionSpec, Credentials, PrimaryView, ReplicaView, ServerIdentity};
use crate::topology::{fan_out, partition_results, ReplicaCommand, TopologyRegistry};
use crate::utils::config::RplConfig;
use crate::{Result, RplError};
use std::time::Duration;
use tokio::time::Instant;

/// 重连检查的默认轮询间隔
const RECONNECT_POLL: Duration = Duration::from_secs(1);

/// 角色变更选项
#[derive(Debug, Clone)]
pub struct FailoverOptions {
    /// 前置检查失败、等待超时时只告警
    pub force: bool,
    /// 从库状态异常时中止 (failover)
    pub pedantic: bool,
    pub quiet: bool,
    /// switchover 后把旧主库接到新主库下
    pub demote: bool,
    /// 有界等待的上限
    pub timeout: Duration,
    /// 重连检查的时间窗口
    pub ping: Duration,
    pub rpl_user: Option<Credentials>,
    pub ssl: SslOptions,
    pub hooks: RoleChangeHooks,
    pub poll_interval: Duration,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            force: false,
            pedantic: false,
            quiet: false,
            demote: false,
            timeout: Duration::from_secs(300),
            ping: Duration::from_secs(3),
            rpl_user: None,
            ssl: SslOptions::default(),
            hooks: RoleChangeHooks::default(),
            poll_interval: RECONNECT_POLL,
        }
    }
}

impl FailoverOptions {
    pub fn from_config(config: &RplConfig) -> Result<Self> {
        Ok(Self {
            force: config.force,
            pedantic: config.pedantic,
            quiet: config.quiet,
            demote: config.demote,
            timeout: config.timeout_duration(),
            ping: config.ping_duration(),
            rpl_user: config.rpl_credentials()?,
            ssl: config.ssl_options(),
            hooks: RoleChangeHooks::new(config.before.clone(), config.after.clone(), config.script_threshold),
            poll_interval: RECONNECT_POLL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// 一次成功的角色变更
#[derive(Debug, Clone)]
pub struct RoleChangeOutcome {
    pub kind: &'static str,
    pub old_primary: Option<ServerIdentity>,
    pub new_primary: ServerIdentity,
    /// 被 force 降级或不影响结果的问题
    pub warnings: Vec<String>,
    /// 在 ping 窗口内未重新连上的从库
    pub unreconnected: Vec<ServerIdentity>,
    pub history: Vec<FailoverState>,
}

impl RoleChangeOutcome {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.unreconnected.is_empty()
    }
}

/// 容忍时记为警告，否则返回错误
fn escalate(
    tolerated: bool,
    message: String,
    kind: fn(String) -> RplError,
    warnings: &mut Vec<String>,
) -> Result<()> {
    if tolerated {
        log::warn!("{}", message);
        warnings.push(message);
        Ok(())
    } else {
        log::error!("{}", message);
        Err(kind(message))
    }
}

/// 追加尚未出现过的警告
fn extend_unique(warnings: &mut Vec<String>, extra: &[String]) {
    for warning in extra {
        if !warnings.contains(warning) {
            warnings.push(warning.clone());
        }
    }
}

/// 角色变更引擎
pub struct FailoverEngine {
    options: FailoverOptions,
    checker: EligibilityChecker,
    tracker: StateTracker,
}

impl FailoverEngine {
    pub fn new(options: FailoverOptions) -> Self {
        let checker = EligibilityChecker::new(options.force, options.rpl_user.clone());
        Self {
            options,
            checker,
            tracker: StateTracker::new("idle"),
        }
    }

    pub fn options(&self) -> &FailoverOptions {
        &self.options
    }

    pub fn checker(&self) -> &EligibilityChecker {
        &self.checker
    }

    /// 最近一次运行的状态
    pub fn state(&self) -> FailoverState {
        self.tracker.current()
    }

    pub fn history(&self) -> Vec<FailoverState> {
        self.tracker.history()
    }

    /// 计划内切换到指定候选
    pub async fn switchover(
        &mut self,
        registry: &mut TopologyRegistry,
        candidate: &ConnectionSpec,
    ) -> Result<RoleChangeOutcome> {
        self.tracker = StateTracker::new("switchover");
        let timer = RoleChangeTimer::start("switchover");
        let result = self.run_switchover(registry, candidate).await;
        self.finish(timer, result)
    }

    /// 主库失效后的故障转移
    pub async fn failover(
        &mut self,
        registry: &mut TopologyRegistry,
        candidates: &[ConnectionSpec],
        strict: bool,
    ) -> Result<RoleChangeOutcome> {
        self.tracker = StateTracker::new("failover");
        let timer = RoleChangeTimer::start("failover");
        let result = self.run_failover(registry, candidates, strict).await;
        self.finish(timer, result)
    }

    fn finish(&self, timer: RoleChangeTimer, result: Result<RoleChangeOutcome>) -> Result<RoleChangeOutcome> {
        match result {
            Ok(mut outcome) => {
                outcome.history = self.tracker.history();
                timer.finish(true);
                Ok(outcome)
            }
            Err(e) => {
                self.tracker.abort(&e.to_string());
                timer.finish(false);
                Err(e)
            }
        }
    }

    fn advance(&self, next: FailoverState) -> Result<()> {
        if self.tracker.advance(next) {
            Ok(())
        } else {
            Err(RplError::ProtocolError(format!(
                "Illegal state transition from {} to {}",
                self.tracker.current(),
                next
            )))
        }
    }

    async fn run_switchover(
        &self,
        registry: &mut TopologyRegistry,
        candidate_spec: &ConnectionSpec,
    ) -> Result<RoleChangeOutcome> {
        let force = self.options.force;
        let mut warnings = Vec::new();

        let primary = registry.require_primary()?.clone();
        if !primary.view.is_alive().await {
            return Err(RplError::ConnectivityError(format!(
                "Cannot connect to master {}.",
                primary.identity
            )));
        }
        let candidate_id = candidate_spec.identity();
        if candidate_id.same_server(&primary.identity) {
            return Err(RplError::InvalidParameter(format!(
                "Candidate slave {} is the current master.",
                candidate_id
            )));
        }
        self.options.hooks.check()?;

        let handle = registry.connect_candidate(candidate_spec).await?;
        let candidate = ReplicaView::new(handle.clone());
        log::info!("[{}] Checking eligibility of candidate {}", primary.identity, candidate_id);

        let gtid_on = primary.view.gtid_enabled().await?;
        if gtid_on {
            let not_on = registry.servers_with_gtid_not_on().await?;
            if !not_on.is_empty() {
                for (identity, mode) in &not_on {
                    log::error!("[{}] GTID_MODE = {}", identity, mode);
                }
                return Err(RplError::PrerequisiteError(
                    "GTIDs are enabled on the master but not on all of the slaves.".to_string(),
                ));
            }
        }

        let eligibility = self
            .checker
            .check_candidate(Some(&primary.view), &candidate, true)
            .await?;
        extend_unique(&mut warnings, &eligibility.warnings);
        if !eligibility.eligible {
            let failed = eligibility
                .failed_check
                .map(|c| c.to_string())
                .unwrap_or_default();
            escalate(
                force,
                format!(
                    "[{}] Candidate does not meet the requirements: {} ({})",
                    candidate_id, eligibility.detail, failed
                ),
                RplError::PrerequisiteError,
                &mut warnings,
            )?;
        }
        self.advance(FailoverState::CandidateSelected)?;

        if gtid_on {
            self.check_errant(registry, &mut warnings).await?;
        }

        let mut misconfigured = Vec::new();
        for (identity, view) in registry.live_replicas().await {
            if !view.is_configured_for(&primary.identity).await? {
                misconfigured.push(format!(
                    "Slave {} is not configured with master {}.",
                    identity, primary.identity
                ));
            }
        }
        if !misconfigured.is_empty() {
            escalate(force, misconfigured.join(" "), RplError::PrerequisiteError, &mut warnings)?;
        }

        let user = self.replication_user(&candidate).await?;
        if let Err(e) = candidate.as_primary().create_replication_user(&user).await {
            escalate(
                force,
                format!("[{}] Cannot create replication user: {}", candidate_id, e),
                RplError::PrerequisiteError,
                &mut warnings,
            )?;
        }
        self.advance(FailoverState::CandidatePrepared)?;

        self.options
            .hooks
            .run_before(Some(&primary.identity), &candidate_id)
            .await?;

        primary.view.fence_writes().await?;
        self.advance(FailoverState::PrimaryFenced)?;

        if let Err(e) = self
            .wait_for_replicas(registry, &primary.view, gtid_on, &mut warnings)
            .await
        {
            self.release_fence(&primary.view).await;
            return Err(e);
        }
        let stopped = self.stop_replicas(registry, &mut warnings).await;
        self.release_fence(&primary.view).await;
        stopped?;

        if self.options.demote {
            log::info!("[{}] Demoting old master to slave", primary.identity);
            primary.view.as_replica().stop().await?;
        }
        registry.swap_roles(handle.clone(), candidate_spec.clone(), self.options.demote);
        self.advance(FailoverState::RolesSwapped)?;

        let new_primary = PrimaryView::new(handle);
        candidate.reset_all().await.map_err(|e| {
            RplError::ProtocolError(format!(
                "[{}] Cannot reset replication on the new master: {}",
                candidate_id, e
            ))
        })?;
        self.repoint_replicas(registry, &new_primary, &user).await?;
        self.start_replicas(registry, &mut warnings).await;
        self.advance(FailoverState::ReplicasRepointed)?;

        self.options
            .hooks
            .run_after(Some(&primary.identity), &candidate_id)
            .await?;

        let unreconnected = self.verify_replicas(registry, &mut warnings).await;
        self.advance(FailoverState::Complete)?;
        log::info!("[{}] Switchover complete", candidate_id);

        Ok(RoleChangeOutcome {
            kind: "switchover",
            old_primary: Some(primary.identity),
            new_primary: candidate_id,
            warnings,
            unreconnected,
            history: Vec::new(),
        })
    }

    async fn run_failover(
        &self,
        registry: &mut TopologyRegistry,
        candidates: &[ConnectionSpec],
        strict: bool,
    ) -> Result<RoleChangeOutcome> {
        let mut warnings = Vec::new();
        self.options.hooks.check()?;
        let old_primary = registry.primary().map(|p| p.identity.clone());

        let record = self
            .checker
            .find_best(registry, candidates, false, strict)
            .await?
            .ok_or_else(|| {
                log::error!("No candidate found for failover");
                RplError::PrerequisiteError("No candidate found for failover.".to_string())
            })?;
        let handle = record.handle.clone().ok_or_else(|| {
            RplError::ConnectivityError(format!("Cannot connect to candidate {}.", record.identity))
        })?;
        let candidate = ReplicaView::new(handle.clone());
        let candidate_id = record.identity.clone();

        if !candidate.gtid_enabled().await? {
            return Err(RplError::PrerequisiteError(
                "Failover requires all servers support global transaction ids and have GTID_MODE=ON"
                    .to_string(),
            ));
        }
        let not_on = registry.servers_with_gtid_not_on().await?;
        if !not_on.is_empty() {
            for (identity, mode) in &not_on {
                log::error!("[{}] GTID_MODE = {}", identity, mode);
            }
            return Err(RplError::PrerequisiteError(
                "Topology must support global transaction ids and have GTID_MODE=ON.".to_string(),
            ));
        }
        log::info!("[{}] Candidate selected to become the new master", candidate_id);
        self.advance(FailoverState::CandidateSelected)?;

        self.check_replicas_status(registry, &mut warnings).await?;
        self.check_errant(registry, &mut warnings).await?;

        let user = self.replication_user(&candidate).await?;
        self.prepare_candidate(registry, &candidate, &user, &mut warnings)
            .await?;
        self.advance(FailoverState::CandidatePrepared)?;

        if let Err(e) = candidate.as_primary().create_replication_user(&user).await {
            let message = format!("[{}] Cannot create replication user: {}", candidate_id, e);
            log::warn!("{}", message);
            warnings.push(message);
        }
        self.options
            .hooks
            .run_before(old_primary.as_ref(), &candidate_id)
            .await?;

        self.stop_replicas(registry, &mut warnings).await?;
        registry.swap_roles(handle.clone(), record.spec.clone(), false);
        self.advance(FailoverState::RolesSwapped)?;

        let new_primary = PrimaryView::new(handle);
        self.repoint_replicas(registry, &new_primary, &user).await?;
        candidate.reset_all().await.map_err(|e| {
            RplError::ProtocolError(format!(
                "[{}] Cannot reset replication on the new master: {}",
                candidate_id, e
            ))
        })?;
        self.start_replicas(registry, &mut warnings).await;
        self.advance(FailoverState::ReplicasRepointed)?;

        self.options
            .hooks
            .run_after(old_primary.as_ref(), &candidate_id)
            .await?;

        let unreconnected = self.verify_replicas(registry, &mut warnings).await;
        self.advance(FailoverState::Complete)?;
        log::info!("[{}] Failover complete", candidate_id);

        Ok(RoleChangeOutcome {
            kind: "failover",
            old_primary,
            new_primary: candidate_id,
            warnings,
            unreconnected,
            history: Vec::new(),
        })
    }

    async fn replication_user(&self, candidate: &ReplicaView) -> Result<Credentials> {
        self.checker.replication_user(candidate).await?.ok_or_else(|| {
            RplError::PrerequisiteError(format!(
                "[{}] Cannot determine the replication user; use --rpl-user.",
                candidate.identity()
            ))
        })
    }

    /// 存在错误事务时中止 (force 时告警)
    async fn check_errant(&self, registry: &TopologyRegistry, warnings: &mut Vec<String>) -> Result<()> {
        let findings = registry.find_errant_transactions().await?;
        if findings.is_empty() {
            return Ok(());
        }
        let listing: Vec<String> = findings
            .iter()
            .map(|f| format!("{} ({})", f.identity, f.gtids))
            .collect();
        escalate(
            self.options.force,
            format!("Errant transactions found on slaves: {}", listing.join("; ")),
            RplError::ConsistencyError,
            warnings,
        )
    }

    /// 从库必须可达且 SQL 线程正常，pedantic 时异常即中止
    async fn check_replicas_status(
        &self,
        registry: &TopologyRegistry,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let mut problems = Vec::new();
        for record in registry.replicas() {
            let view = match record.live_view().await {
                Some(view) => view,
                None => {
                    problems.push(format!("Slave '{}' is not alive.", record.identity));
                    continue;
                }
            };
            match view.status().await? {
                None => problems.push(format!("Server '{}' is not acting as a slave.", record.identity)),
                Some(status) if !status.sql_running || status.has_sql_error() => problems.push(format!(
                    "Problem detected with SQL thread for slave '{}' that can result on a unstable topology.",
                    record.identity
                )),
                Some(_) => {}
            }
        }
        if problems.is_empty() {
            return Ok(());
        }
        if self.options.pedantic {
            let message = problems.join(" ");
            log::error!("{}", message);
            return Err(RplError::PrerequisiteError(message));
        }
        for message in problems {
            log::warn!("{}", message);
            warnings.push(message);
        }
        Ok(())
    }

    /// 候选追平其他从库
    ///
    /// 先等每个从库执行完已拉取的事务，再让候选临时复制缺少事务的从库。
    async fn prepare_candidate(
        &self,
        registry: &TopologyRegistry,
        candidate: &ReplicaView,
        user: &Credentials,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let candidate_id = candidate.identity();
        let others: Vec<(ServerIdentity, ReplicaView)> = registry
            .live_replicas()
            .await
            .into_iter()
            .filter(|(identity, _)| !identity.same_server(&candidate_id))
            .collect();

        let timeout = self.options.timeout;
        let drained = fan_out(others.clone(), None, |view| async move {
            let status = view.require_status().await?;
            view.wait_for_gtid(&status.retrieved_gtid_set, timeout).await
        })
        .await;
        for (identity, result) in drained {
            match result {
                Ok(true) => {}
                Ok(false) => escalate(
                    self.options.force,
                    format!("[{}] Slave did not apply its relay log within {:?}.", identity, timeout),
                    RplError::TimeoutError,
                    warnings,
                )?,
                Err(e) => {
                    let message = format!("[{}] Cannot read relay log state: {}", identity, e);
                    log::warn!("{}", message);
                    warnings.push(message);
                }
            }
        }

        for (identity, other) in &others {
            let own = candidate.gtid_executed().await?;
            let retrieved = other
                .status()
                .await?
                .map(|s| s.retrieved_gtid_set)
                .unwrap_or_default();
            let theirs = other.gtid_executed().await?.union(&retrieved);
            if theirs.is_subset(&own) {
                log::debug!("[{}] Candidate already has all transactions of {}", candidate_id, identity);
                continue;
            }
            log::info!(
                "[{}] Candidate is missing {} transaction(s) from slave {}",
                candidate_id,
                theirs.subtract(&own).count(),
                identity
            );
            if !self.catch_up_from(candidate, other, user).await? {
                escalate(
                    self.options.force,
                    format!("[{}] Candidate did not catch up to slave {}.", candidate_id, identity),
                    RplError::TimeoutError,
                    warnings,
                )?;
            }
        }
        Ok(())
    }

    /// 候选临时作为 source 的从库，直到执行完 source 的事务
    async fn catch_up_from(&self, candidate: &ReplicaView, source: &ReplicaView, user: &Credentials) -> Result<bool> {
        let upstream = source.as_primary();
        candidate.stop().await?;
        upstream.fence_writes().await?;
        let switched = candidate.switch_to(&upstream, user, &self.options.ssl, false).await;
        upstream.set_read_only(false).await?;
        upstream.release_fence().await?;
        switched.map_err(|e| {
            RplError::ProtocolError(format!(
                "Cannot switch candidate to slave for slave promotion process. {}",
                e
            ))
        })?;

        candidate.start().await?;
        let target: GtidSet = upstream.gtid_executed().await?;
        let caught_up = candidate.wait_for_gtid(&target, self.options.timeout).await?;
        candidate.stop().await?;
        Ok(caught_up)
    }

    /// 所有从库追平主库 (写屏蔽期间)
    async fn wait_for_replicas(
        &self,
        registry: &TopologyRegistry,
        primary: &PrimaryView,
        gtid_on: bool,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let timeout = self.options.timeout;
        let results = if gtid_on {
            let executed = primary.gtid_executed().await?;
            log::info!("[{}] Waiting for slaves to catch up to {}", primary.identity(), executed);
            fan_out(registry.live_replicas().await, None, |view| {
                let executed = executed.clone();
                async move { view.wait_for_gtid(&executed, timeout).await }
            })
            .await
        } else {
            let status = primary.status().await?.ok_or_else(|| {
                RplError::PrerequisiteError(format!("[{}] No binlog on master.", primary.identity()))
            })?;
            log::info!(
                "[{}] Waiting for slaves to reach {}:{}",
                primary.identity(),
                status.log_file,
                status.log_position
            );
            fan_out(registry.live_replicas().await, None, |view| {
                let file = status.log_file.clone();
                let position = status.log_position;
                async move { view.wait_for_position(&file, position, timeout).await }
            })
            .await
        };

        for (identity, result) in results {
            let reached = match result {
                Ok(reached) => reached,
                Err(e) => {
                    log::warn!("[{}] {}", identity, e);
                    false
                }
            };
            if !reached {
                escalate(
                    self.options.force,
                    format!("Slave {} did not catch up to the master.", identity),
                    RplError::TimeoutError,
                    warnings,
                )?;
            }
        }
        Ok(())
    }

    /// 换主前停止所有从库
    ///
    /// 不可达的从库只记警告；可达却停不下来的从库仍在应用旧主库的事务，
    /// 非 force 时恢复已停止的从库并中止。
    async fn stop_replicas(&self, registry: &TopologyRegistry, warnings: &mut Vec<String>) -> Result<()> {
        let results = registry.run_on_replicas(ReplicaCommand::Stop, self.options.quiet).await;
        let (_, failed) = partition_results(results);

        let mut running = Vec::new();
        for (identity, e) in failed {
            let message = format!("[{}] Cannot stop slave: {}", identity, e);
            match e {
                RplError::ConnectivityError(_) => warnings.push(message),
                _ => running.push(message),
            }
        }
        if running.is_empty() {
            return Ok(());
        }
        if !self.options.force {
            log::info!("Restarting slaves stopped before the abort");
            registry.run_on_replicas(ReplicaCommand::Start, self.options.quiet).await;
        }
        escalate(self.options.force, running.join(" "), RplError::ProtocolError, warnings)
    }

    /// 换主后启动所有从库，失败只记警告
    async fn start_replicas(&self, registry: &TopologyRegistry, warnings: &mut Vec<String>) {
        let results = registry.run_on_replicas(ReplicaCommand::Start, self.options.quiet).await;
        let (_, failed) = partition_results(results);
        for (identity, e) in failed {
            warnings.push(format!("[{}] Cannot start slave: {}", identity, e));
        }
    }

    /// 尽力释放写屏蔽
    async fn release_fence(&self, primary: &PrimaryView) {
        if let Err(e) = primary.set_read_only(false).await {
            log::warn!("[{}] Cannot clear read-only: {}", primary.identity(), e);
        }
        if let Err(e) = primary.release_fence().await {
            log::warn!("[{}] Cannot unlock tables: {}", primary.identity(), e);
        }
    }

    /// 所有可达从库指向新主库 (不启动)
    async fn repoint_replicas(
        &self,
        registry: &TopologyRegistry,
        new_primary: &PrimaryView,
        user: &Credentials,
    ) -> Result<()> {
        log::info!("[{}] Switching slaves to new master", new_primary.identity());
        for record in registry.replicas() {
            match record.live_view().await {
                Some(view) => {
                    view.switch_to(new_primary, user, &self.options.ssl, false).await?;
                }
                None => log::warn!("[{}] Slave unreachable, not switched", record.identity),
            }
        }
        Ok(())
    }

    /// 在 ping 窗口内轮询从库连接状态
    async fn verify_replicas(&self, registry: &TopologyRegistry, warnings: &mut Vec<String>) -> Vec<ServerIdentity> {
        let deadline = Instant::now() + self.options.ping;
        let mut pending = registry.live_replicas().await;

        loop {
            let mut still = Vec::new();
            for (identity, view) in pending {
                let connected = matches!(view.status().await, Ok(Some(status)) if status.is_connected());
                if !connected {
                    still.push((identity, view));
                }
            }
            pending = still;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }

        let mut unreconnected = Vec::new();
        for (identity, _) in pending {
            let message = format!("[{}] Slave did not reconnect to the new master.", identity);
            log::warn!("{}", message);
            warnings.push(message);
            unreconnected.push(identity);
        }
        unreconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::{LabCluster, LabServer};
    use crate::topology::test_support::*;
    use std::sync::Arc;

    fn options() -> FailoverOptions {
        FailoverOptions {
            timeout: Duration::from_millis(500),
            ping: Duration::from_millis(200),
            ..FailoverOptions::default()
        }
        .with_poll_interval(Duration::from_millis(10))
    }

    fn id(host: &str) -> ServerIdentity {
        ServerIdentity::new(host, 3306)
    }

    fn upstream_of(cluster: &LabCluster, host: &str) -> Option<ServerIdentity> {
        cluster
            .server(&id(host))
            .and_then(|s| s.upstream.map(|u| u.identity))
    }

    #[tokio::test]
    async fn test_switchover_gtid() {
        let cluster = star("p", &["r1", "r2"], 5);
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        let mut engine = FailoverEngine::new(options());

        let outcome = engine.switchover(&mut registry, &spec("r1")).await.unwrap();
        assert_eq!(outcome.new_primary, id("r1"));
        assert_eq!(outcome.old_primary, Some(id("p")));
        assert!(outcome.is_clean(), "{:?}", outcome.warnings);
        assert!(outcome.history.contains(&FailoverState::PrimaryFenced));
        assert_eq!(engine.state(), FailoverState::Complete);

        assert!(upstream_of(&cluster, "r1").is_none());
        assert_eq!(upstream_of(&cluster, "r2"), Some(id("r1")));
        let old = cluster.server(&id("p")).unwrap();
        assert!(!old.read_only && !old.global_read_lock);

        assert_eq!(registry.primary().unwrap().identity, id("r1"));
        assert_eq!(registry.replicas().len(), 1);

        // 再次 reset_all 不改变结果
        registry.primary().unwrap().view.as_replica().reset_all().await.unwrap();
        assert!(upstream_of(&cluster, "r1").is_none());
    }

    #[tokio::test]
    async fn test_switchover_demotes_old_primary() {
        let cluster = star("p", &["r1", "r2"], 2);
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        let mut engine = FailoverEngine::new(FailoverOptions {
            demote: true,
            ..options()
        });

        engine.switchover(&mut registry, &spec("r1")).await.unwrap();
        assert_eq!(upstream_of(&cluster, "p"), Some(id("r1")));

        let fresh = cluster.commit(&id("r1"), 3).unwrap();
        cluster.pump();
        for host in ["p", "r2"] {
            assert!(fresh.is_subset(&cluster.server(&id(host)).unwrap().executed));
        }
    }

    #[tokio::test]
    async fn test_switchover_without_gtid_uses_positions() {
        let cluster = LabCluster::new();
        for (i, host) in ["p", "r1", "r2"].iter().enumerate() {
            let mut server = LabServer::new(host, 3306, i as u32 + 1);
            server.gtid_mode = false;
            cluster.add_server(server);
        }
        cluster.attach(&id("r1"), &id("p"), &rpl()).unwrap();
        cluster.attach(&id("r2"), &id("p"), &rpl()).unwrap();
        cluster.commit(&id("p"), 4).unwrap();

        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        let mut engine = FailoverEngine::new(options());
        engine.switchover(&mut registry, &spec("r1")).await.unwrap();

        let r2 = cluster.server(&id("r2")).unwrap();
        let upstream = r2.upstream.unwrap();
        assert_eq!(upstream.identity, id("r1"));
        assert!(!upstream.auto_position);
    }

    #[tokio::test]
    async fn test_switchover_aborts_before_fence_on_gtid_mismatch() {
        let cluster = star("p", &["r1"], 1);
        cluster.update(&id("r1"), |s| s.gtid_mode = false);
        let mut registry = registry(&cluster, Some("p"), &["r1"]).await;
        let mut engine = FailoverEngine::new(options());

        let err = engine.switchover(&mut registry, &spec("r1")).await.unwrap_err();
        assert!(matches!(err, RplError::PrerequisiteError(_)));
        assert_eq!(engine.state(), FailoverState::Aborted);
        assert!(!engine.history().contains(&FailoverState::PrimaryFenced));
        assert_eq!(registry.primary().unwrap().identity, id("p"));
        assert!(!cluster.server(&id("p")).unwrap().read_only);
    }

    #[tokio::test]
    async fn test_forced_switchover_reports_filter_difference() {
        let cluster = star("p", &["r1", "r2"], 1);
        cluster.update(&id("r1"), |s| s.binlog_do_db = vec!["sales".to_string()]);

        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        let mut engine = FailoverEngine::new(options());
        let err = engine.switchover(&mut registry, &spec("r1")).await.unwrap_err();
        assert!(matches!(err, RplError::PrerequisiteError(_)));

        let mut engine = FailoverEngine::new(FailoverOptions {
            force: true,
            ..options()
        });
        let outcome = engine.switchover(&mut registry, &spec("r1")).await.unwrap();
        let reported = outcome.warnings.iter().filter(|w| w.contains("filters differ")).count();
        assert_eq!(reported, 1, "{:?}", outcome.warnings);
        assert_eq!(outcome.new_primary, id("r1"));
    }

    #[tokio::test]
    async fn test_switchover_aborts_when_replica_cannot_stop() {
        let cluster = star("p", &["r1", "r2"], 2);
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        // r2 可达，但登录账号无权执行 STOP SLAVE
        cluster.update(&id("r2"), |s| {
            for user in s.users.iter_mut().filter(|u| u.account.user == "root") {
                user.privileges.remove("SUPER");
            }
        });
        let mut engine = FailoverEngine::new(options());

        let err = engine.switchover(&mut registry, &spec("r1")).await.unwrap_err();
        assert!(matches!(err, RplError::ProtocolError(ref m) if m.contains("r2:3306")), "{}", err);
        assert_eq!(engine.state(), FailoverState::Aborted);
        assert!(!engine.history().contains(&FailoverState::RolesSwapped));

        assert_eq!(registry.primary().unwrap().identity, id("p"));
        let r1 = cluster.server(&id("r1")).unwrap();
        assert!(r1.sql_running);
        assert_eq!(upstream_of(&cluster, "r1"), Some(id("p")));
        let p = cluster.server(&id("p")).unwrap();
        assert!(!p.read_only && !p.global_read_lock);
    }

    #[tokio::test]
    async fn test_unreachable_replica_only_warns_during_switchover() {
        let cluster = star("p", &["r1", "r2"], 2);
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        cluster.set_alive(&id("r2"), false);
        let mut engine = FailoverEngine::new(options());

        let outcome = engine.switchover(&mut registry, &spec("r1")).await.unwrap();
        assert_eq!(outcome.new_primary, id("r1"));
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.starts_with("[r2:3306] Cannot stop slave")), "{:?}", outcome.warnings);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.starts_with("[r2:3306] Cannot start slave")), "{:?}", outcome.warnings);
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_errant_transactions_block_switchover() {
        let cluster = star("p", &["r1", "r2"], 2);
        cluster.commit(&id("r2"), 1).unwrap();
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        let mut engine = FailoverEngine::new(options());

        let err = engine.switchover(&mut registry, &spec("r1")).await.unwrap_err();
        assert!(matches!(err, RplError::ConsistencyError(_)));
        assert_eq!(registry.primary().unwrap().identity, id("p"));
    }

    #[tokio::test]
    async fn test_failover_picks_caught_up_replica() {
        let cluster = star("p", &["r1", "r2"], 3);
        cluster.update(&id("r2"), |s| s.io_paused = true);
        let lost = cluster.commit(&id("p"), 5).unwrap();
        cluster.pump();
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        cluster.set_alive(&id("p"), false);
        let mut engine = FailoverEngine::new(options());
        let outcome = engine.failover(&mut registry, &[], false).await.unwrap();

        assert_eq!(outcome.new_primary, id("r1"));
        assert!(!outcome.history.contains(&FailoverState::PrimaryFenced));
        assert!(upstream_of(&cluster, "r1").is_none());
        assert_eq!(upstream_of(&cluster, "r2"), Some(id("r1")));

        cluster.pump();
        assert!(lost.is_subset(&cluster.server(&id("r2")).unwrap().executed));
    }

    #[tokio::test]
    async fn test_failover_candidate_catches_up_from_other_replica() {
        let cluster = star("p", &["r1", "r2"], 2);
        cluster.update(&id("r1"), |s| s.io_paused = true);
        let missing = cluster.commit(&id("p"), 4).unwrap();
        cluster.pump();
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        cluster.set_alive(&id("p"), false);
        let mut engine = FailoverEngine::new(options());
        let outcome = engine.failover(&mut registry, &[spec("r1")], true).await.unwrap();

        assert_eq!(outcome.new_primary, id("r1"));
        assert!(missing.is_subset(&cluster.server(&id("r1")).unwrap().executed));
        assert_eq!(upstream_of(&cluster, "r2"), Some(id("r1")));
        assert!(!cluster.server(&id("r2")).unwrap().read_only);
    }

    #[tokio::test]
    async fn test_failover_requires_gtid() {
        let cluster = star("p", &["r1", "r2"], 1);
        for host in ["r1", "r2"] {
            cluster.update(&id(host), |s| s.gtid_mode = false);
        }
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        cluster.set_alive(&id("p"), false);
        let mut engine = FailoverEngine::new(options());

        let err = engine.failover(&mut registry, &[], false).await.unwrap_err();
        assert!(matches!(err, RplError::PrerequisiteError(_)));
        assert_eq!(engine.state(), FailoverState::Aborted);
    }

    #[tokio::test]
    async fn test_pedantic_failover_rejects_stopped_sql_thread() {
        let cluster = star("p", &["r1", "r2"], 1);
        cluster
            .execute(&id("r2"), &crate::server::Statement::StopSqlThread)
            .unwrap();
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        cluster.set_alive(&id("p"), false);
        let mut engine = FailoverEngine::new(FailoverOptions {
            pedantic: true,
            ..options()
        });
        let err = engine.failover(&mut registry, &[], false).await.unwrap_err();
        assert!(matches!(err, RplError::PrerequisiteError(_)));

        let connector = Arc::new(cluster.connector());
        let mut registry = TopologyRegistry::connect(connector, None, &[spec("r1"), spec("r2")], false)
            .await
            .unwrap();
        let mut engine = FailoverEngine::new(options());
        let outcome = engine.failover(&mut registry, &[], false).await.unwrap();
        assert!(outcome.warnings.iter().any(|w| w.contains("SQL thread")));
    }
}
