//! 多源轮转复制
//!
//! 一个从库按固定时间片依次复制多个主库。每个主库第一次轮到时完整搭建
//! (`ReplicationSetup`)，之后只做 STOP / CHANGE MASTER / START。
//! 所有成员都必须开启 GTID。

use crate::observability::RoleChangeTimer;
use crate::replication::{ReplicationSetup, SslOptions};
use crate::server::view::gtid_mode;
use crate::server::{
    ConnectionSpec, Connector, Credentials, PrimaryView, ReplicaView, ServerHandle, ServerIdentity,
};
use crate::topology::{render_uuids, HealthThresholds, TopologyRegistry};
use crate::utils::config::{ReportValue, RplConfig};
use crate::{Result, RplError};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 单个主库的连接尝试次数
const CONNECT_ATTEMPTS: u32 = 3;

/// 首轮搭建时等待 IO 线程连上的轮询次数
const SETUP_TRIES: u32 = 10;

/// 轮转调度器
pub struct MultiSourceScheduler {
    connector: Arc<dyn Connector>,
    primaries: Vec<ConnectionSpec>,
    replica_spec: ConnectionSpec,
    replica: ReplicaView,
    rpl_user: Credentials,
    ssl: SslOptions,
    pedantic: bool,
    slice: Duration,
    report_interval: Duration,
    report_values: Vec<ReportValue>,
    thresholds: HealthThresholds,
    poll_interval: Duration,
    retry_delay: Duration,
    /// 已完成首轮搭建的主库
    configured: HashSet<ServerIdentity>,
    next: usize,
    /// 连续无法连接的主库数
    unreachable: usize,
    current: Option<ServerIdentity>,
}

impl MultiSourceScheduler {
    pub async fn connect(
        connector: Arc<dyn Connector>,
        primaries: Vec<ConnectionSpec>,
        replica_spec: ConnectionSpec,
        config: &RplConfig,
    ) -> Result<Self> {
        if primaries.is_empty() {
            return Err(RplError::InvalidParameter(
                "At least one master is required for multi-source replication.".to_string(),
            ));
        }
        let rpl_user = config.rpl_credentials()?.ok_or_else(|| {
            RplError::ConfigError("--rpl-user is required for multi-source replication".to_string())
        })?;
        let handle = connector.connect(&replica_spec).await.map_err(|e| {
            log::error!("[{}] Cannot connect to slave: {}", replica_spec.identity(), e);
            e
        })?;

        Ok(Self {
            connector,
            primaries,
            replica_spec,
            replica: ReplicaView::new(handle),
            rpl_user,
            ssl: config.ssl_options(),
            pedantic: config.pedantic,
            slice: Duration::from_secs(config.switchover_interval),
            report_interval: config.interval_duration(),
            report_values: config.report_values.clone(),
            thresholds: HealthThresholds::from_config(config),
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            configured: HashSet::new(),
            next: 0,
            unreachable: 0,
            current: None,
        })
    }

    /// 覆盖时间片、报告间隔与轮询间隔
    pub fn with_timing(mut self, slice: Duration, report_interval: Duration, poll_interval: Duration) -> Self {
        self.slice = slice;
        self.report_interval = report_interval;
        self.poll_interval = poll_interval;
        self.retry_delay = poll_interval;
        self
    }

    /// 当前复制的主库
    pub fn current(&self) -> Option<&ServerIdentity> {
        self.current.as_ref()
    }

    pub fn replica(&self) -> &ReplicaView {
        &self.replica
    }

    /// 启动前检查：GTID 全开，地址形式一致 (只告警)
    pub async fn check_prerequisites(&self) -> Result<()> {
        let mut identities = vec![self.replica.identity()];
        let mut not_on = Vec::new();

        let mode = gtid_mode(self.replica.handle()).await?;
        if mode != "ON" {
            not_on.push((self.replica.identity(), mode));
        }
        for spec in &self.primaries {
            identities.push(spec.identity());
            match self.connector.connect(spec).await {
                Ok(handle) => {
                    let mode = gtid_mode(&handle).await?;
                    if mode != "ON" {
                        not_on.push((spec.identity(), mode));
                    }
                }
                Err(e) => log::warn!("[{}] Cannot connect to master: {}", spec.identity(), e),
            }
        }
        if !not_on.is_empty() {
            for (identity, mode) in &not_on {
                log::error!("[{}] GTID_MODE = {}", identity, mode);
            }
            return Err(RplError::PrerequisiteError(
                "Multi-source replication requires GTID_MODE=ON on all servers.".to_string(),
            ));
        }

        let ips = identities.iter().filter(|i| i.is_ip_address()).count();
        if ips > 0 && ips < identities.len() {
            log::warn!("Mixing host names and IP addresses is not recommended.");
        }
        Ok(())
    }

    async fn connect_primary(&self, spec: &ConnectionSpec) -> Option<ServerHandle> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.connector.connect(spec).await {
                Ok(handle) => return Some(handle),
                Err(e) => {
                    log::warn!(
                        "[{}] Cannot connect to master (attempt {}/{}): {}",
                        spec.identity(),
                        attempt,
                        CONNECT_ATTEMPTS,
                        e
                    );
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        None
    }

    /// 切换到下一个主库
    ///
    /// 主库不可达时跳过并返回 None；一整轮都不可达时返回错误。
    pub async fn step(&mut self) -> Result<Option<ServerIdentity>> {
        let spec = self.primaries[self.next].clone();
        self.next = (self.next + 1) % self.primaries.len();
        let identity = spec.identity();

        let handle = match self.connect_primary(&spec).await {
            Some(handle) => handle,
            None => {
                self.unreachable += 1;
                if self.unreachable >= self.primaries.len() {
                    log::error!("None of the masters could be reached");
                    return Err(RplError::ConnectivityError(
                        "None of the masters could be reached.".to_string(),
                    ));
                }
                log::warn!("[{}] Master skipped for this round", identity);
                return Ok(None);
            }
        };
        self.unreachable = 0;

        let timer = RoleChangeTimer::start("multisource");
        let result = self.switch_to(&identity, PrimaryView::new(handle)).await;
        timer.finish(result.is_ok());
        result?;

        self.current = Some(identity.clone());
        Ok(Some(identity))
    }

    async fn switch_to(&mut self, identity: &ServerIdentity, primary: PrimaryView) -> Result<()> {
        let replica_id = self.replica.identity();
        if self.configured.contains(identity) {
            log::info!("[{}] Switching to master {}", replica_id, identity);
            self.replica.stop().await?;
            self.replica
                .switch_to(&primary, &self.rpl_user, &self.ssl, false)
                .await?;
            return self.replica.start().await;
        }

        log::info!("[{}] Setting up replication from master {}", replica_id, identity);
        let setup = ReplicationSetup::new(primary, self.replica.clone())
            .with_ssl(self.ssl.clone())
            .with_pedantic(self.pedantic)
            .with_poll_interval(self.poll_interval);
        for warning in setup.check_all().await? {
            log::warn!("[{}] {}", identity, warning);
        }
        if !setup.setup(&self.rpl_user, SETUP_TRIES).await? {
            log::warn!(
                "[{}] Slave did not connect to master {} after {} attempts",
                replica_id,
                identity,
                SETUP_TRIES
            );
        }
        self.configured.insert(identity.clone());
        Ok(())
    }

    /// 按 report_values 输出当前主从的状态
    pub async fn report(&self) -> Result<String> {
        let current = match &self.current {
            Some(current) => current,
            None => return Ok(String::new()),
        };
        let primary = self.primaries.iter().find(|s| s.identity() == *current);
        let registry = TopologyRegistry::connect(
            self.connector.clone(),
            primary,
            std::slice::from_ref(&self.replica_spec),
            false,
        )
        .await?;

        let mut sections = Vec::new();
        for value in &self.report_values {
            match value {
                ReportValue::Health => sections.push(registry.health(&self.thresholds).await.render()),
                ReportValue::Gtid => sections.push(registry.gtid_data().await.render()),
                ReportValue::Uuid => sections.push(render_uuids(&registry.server_uuids().await?)),
            }
        }
        let text = sections.join("\n");
        log::info!("[{}] Current master {}\n{}", self.replica.identity(), current, text);
        Ok(text)
    }

    /// 运行直到 ctrl-c
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// 按轮次切换，直到 shutdown 完成或出错
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.check_prerequisites().await?;
        tokio::pin!(shutdown);

        loop {
            if self.step().await?.is_none() {
                continue;
            }
            let deadline = Instant::now() + self.slice;
            loop {
                if let Err(e) = self.report().await {
                    log::warn!("Cannot report replication status: {}", e);
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let wait = self.report_interval.min(deadline - now);
                tokio::select! {
                    _ = &mut shutdown => {
                        log::info!("Multi-source replication stopped");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}
