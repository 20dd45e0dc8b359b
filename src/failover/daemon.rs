//! 主库监控守护进程
//!
//! 每个 interval 检查一次主库存活，确认失效后按 failover_mode 处理：
//! auto 在所有从库中选举，elect 只在候选中选举，fail 只报告并退出。

use super::engine::{FailoverEngine, FailoverOptions, RoleChangeOutcome};
use super::hooks::{role_change_args, ScriptHook};
use crate::observability;
use crate::server::{ConnectionSpec, Credentials, ServerIdentity};
use crate::topology::{HealthThresholds, TopologyRegistry};
use crate::utils::config::{FailoverMode, RplConfig};
use crate::{Result, RplError};
use std::future::Future;
use std::time::Duration;

/// 确认失效前的重连次数
const RECONNECT_ATTEMPTS: usize = 3;

/// 主库存活探测方式
#[derive(Debug, Clone)]
pub enum LivenessProbe {
    /// 连接探测
    Ping,
    /// 外部脚本，非零退出码表示需要故障转移
    Script(ScriptHook),
}

/// 故障转移守护进程
pub struct FailoverDaemon {
    mode: FailoverMode,
    engine: FailoverEngine,
    probe: LivenessProbe,
    post_fail: Option<ScriptHook>,
    candidates: Vec<ConnectionSpec>,
    discover: Option<Credentials>,
    thresholds: HealthThresholds,
    interval: Duration,
    ping: Duration,
    fail_retry: Option<Duration>,
    pedantic: bool,
    no_health: bool,
    first_pass: bool,
}

impl FailoverDaemon {
    pub fn from_config(config: &RplConfig) -> Result<Self> {
        Self::new(config, FailoverOptions::from_config(config)?)
    }

    pub fn new(config: &RplConfig, options: FailoverOptions) -> Result<Self> {
        let probe = match &config.exec_fail {
            Some(path) => LivenessProbe::Script(ScriptHook::new(path.clone(), None)),
            None => LivenessProbe::Ping,
        };
        Ok(Self {
            mode: config.failover_mode,
            engine: FailoverEngine::new(options),
            probe,
            post_fail: config
                .post_fail
                .as_ref()
                .map(|p| ScriptHook::new(p.clone(), config.script_threshold)),
            candidates: config.candidate_specs()?,
            discover: config.discover_credentials()?,
            thresholds: HealthThresholds::from_config(config),
            interval: config.interval_duration(),
            ping: config.ping_duration(),
            fail_retry: config.fail_retry.map(Duration::from_secs),
            pedantic: config.pedantic,
            no_health: config.no_health,
            first_pass: true,
        })
    }

    /// 覆盖检查间隔与重连等待
    pub fn with_timing(mut self, interval: Duration, ping: Duration) -> Self {
        self.interval = interval;
        self.ping = ping;
        self
    }

    pub fn engine(&self) -> &FailoverEngine {
        &self.engine
    }

    /// 启动前检查
    pub async fn check_prerequisites(&self, registry: &TopologyRegistry) -> Result<()> {
        registry.require_primary()?;
        if let LivenessProbe::Script(hook) = &self.probe {
            hook.check()?;
        }
        if let Some(hook) = &self.post_fail {
            hook.check()?;
        }
        self.engine.options().hooks.check()?;

        if !registry.gtid_enabled().await? {
            return Err(RplError::PrerequisiteError(
                "Topology must support global transaction ids and have GTID_MODE=ON.".to_string(),
            ));
        }
        if !registry.check_master_info_type("TABLE").await? {
            return Err(RplError::PrerequisiteError(
                "Failover requires --master-info-repository=TABLE for all slaves.".to_string(),
            ));
        }
        if registry.mixes_hostnames_and_ips() {
            log::warn!("Mixing host names and IP addresses is not recommended.");
        }

        let errant = registry.find_errant_transactions().await?;
        if !errant.is_empty() {
            let message = format!("Errant transactions found on {} slave(s).", errant.len());
            if self.pedantic {
                log::error!("{}", message);
                return Err(RplError::ConsistencyError(message));
            }
            log::warn!("{}", message);
        }

        if self.mode != FailoverMode::Fail {
            let findings = registry.check_privileges(true, false, &self.candidates).await?;
            if !findings.is_empty() {
                let detail: Vec<String> = findings.iter().map(|f| f.describe()).collect();
                return Err(RplError::PrerequisiteError(detail.join(" ")));
            }
        }
        Ok(())
    }

    /// 主库是否确认失效
    pub async fn primary_lost(&self, registry: &TopologyRegistry) -> Result<bool> {
        let primary = registry.require_primary()?;
        match &self.probe {
            LivenessProbe::Script(hook) => {
                let code = hook.run(&role_change_args(Some(&primary.identity), None)).await?;
                Ok(code != 0)
            }
            LivenessProbe::Ping => {
                if primary.view.is_alive().await {
                    return Ok(false);
                }
                let handle = primary.view.handle();
                log::warn!("[{}] Master may be down, waiting {:?} before reconnecting", primary.identity, self.ping);
                tokio::time::sleep(self.ping).await;
                if handle.reconnect().await.is_ok() {
                    return Ok(false);
                }
                if let Some(retry) = self.fail_retry {
                    log::warn!("[{}] Waiting {:?} before retrying", primary.identity, retry);
                    tokio::time::sleep(retry).await;
                    if handle.reconnect().await.is_ok() {
                        return Ok(false);
                    }
                }
                for attempt in 1..=RECONNECT_ATTEMPTS {
                    log::warn!("[{}] Reconnect attempt {} of {}", primary.identity, attempt, RECONNECT_ATTEMPTS);
                    if handle.reconnect().await.is_ok() {
                        return Ok(false);
                    }
                    tokio::time::sleep(self.ping).await;
                }
                Ok(true)
            }
        }
    }

    /// 执行一次检查，发生故障转移时返回结果
    pub async fn tick(&mut self, registry: &mut TopologyRegistry) -> Result<Option<RoleChangeOutcome>> {
        let mut outcome = None;

        if self.primary_lost(registry).await? {
            let old = registry.primary().map(|p| p.identity.clone());
            log::error!(
                "[{}] Master has failed",
                old.as_ref().map(|o| o.to_string()).unwrap_or_default()
            );

            if self.mode == FailoverMode::Fail {
                self.run_post_fail(old.as_ref(), None).await;
                return Err(RplError::ConnectivityError(
                    "Master has failed and automatic failover is not enabled.".to_string(),
                ));
            }

            let strict = self.mode == FailoverMode::Elect;
            let result = self.engine.failover(registry, &self.candidates, strict).await?;
            if let Some(credentials) = &self.discover {
                registry.remove_discovered_replicas();
                registry.discover_replicas(credentials, true).await?;
            }
            self.run_post_fail(old.as_ref(), Some(&result.new_primary)).await;
            outcome = Some(result);
        } else if !self.first_pass {
            if let Some(credentials) = &self.discover {
                registry.discover_replicas(credentials, true).await?;
            }
        }
        self.first_pass = false;

        registry.find_errant_transactions().await?;
        if !self.no_health {
            let report = registry.health(&self.thresholds).await;
            log::info!("Replication health:\n{}", report.render());
        }
        log::debug!("{}", observability::gather());
        Ok(outcome)
    }

    async fn run_post_fail(&self, old: Option<&ServerIdentity>, new: Option<&ServerIdentity>) {
        if let Some(hook) = &self.post_fail {
            if let Err(e) = hook.run(&role_change_args(old, new)).await {
                log::error!("{}", e);
            }
        }
    }

    /// 运行直到 ctrl-c
    pub async fn run(&mut self, registry: &mut TopologyRegistry) -> Result<()> {
        self.run_until(registry, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// 运行直到 shutdown 完成或出错
    pub async fn run_until<F>(&mut self, registry: &mut TopologyRegistry, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.check_prerequisites(registry).await?;
        log::info!(
            "Failover daemon started (mode {:?}, interval {:?})",
            self.mode,
            self.interval
        );

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Failover daemon stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.tick(registry).await?;
                }
            }
        }
    }
}
