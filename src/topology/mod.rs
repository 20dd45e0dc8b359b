//! 复制拓扑注册表
//!
//! 持有一个可选主库与有序的从库列表 (插入顺序)。
//! 变更只来自三处：发现从库、移除从库、角色交换。
//! 其余查询都是不修改状态的快照。
//!
//! ```text
//!            ┌──────────────┐
//!            │ PrimaryRecord│  PrimaryView
//!            └──────┬───────┘
//!      ┌────────────┼────────────┐
//!      ▼            ▼            ▼
//! ReplicaRecord ReplicaRecord ReplicaRecord   handle: Option<ServerHandle>
//! ```

pub mod errant;
pub mod fanout;
pub mod health;
pub mod privileges;

pub use errant::ErrantFinding;
pub use fanout::{fan_out, partition_results};
pub use health::{HealthReport, HealthRow, HealthThresholds, ServerRole, ServerState};
pub use privileges::{PrivilegeFinding, ADMIN_PRIVILEGES};

use crate::gtid::GtidSet;
use crate::server::view::gtid_mode;
use crate::server::{
    ConnectionSpec, Connector, Credentials, PrimaryView, ReplicaView, ServerHandle, ServerIdentity,
};
use crate::utils::config::RplConfig;
use crate::{Result, RplError};
use std::fmt;
use std::sync::Arc;

/// 主库记录
#[derive(Clone)]
pub struct PrimaryRecord {
    pub identity: ServerIdentity,
    pub spec: ConnectionSpec,
    pub view: PrimaryView,
}

impl fmt::Debug for PrimaryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryRecord")
            .field("identity", &self.identity)
            .finish()
    }
}

/// 从库记录；连接失败时 handle 为 None
#[derive(Clone)]
pub struct ReplicaRecord {
    pub identity: ServerIdentity,
    pub spec: ConnectionSpec,
    pub handle: Option<ServerHandle>,
    /// 通过主库公告发现，故障切换后可清除重新发现
    pub discovered: bool,
}

impl fmt::Debug for ReplicaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaRecord")
            .field("identity", &self.identity)
            .field("connected", &self.handle.is_some())
            .field("discovered", &self.discovered)
            .finish()
    }
}

impl ReplicaRecord {
    pub fn view(&self) -> Option<ReplicaView> {
        self.handle.clone().map(ReplicaView::new)
    }

    /// 已连接且存活时的视图
    pub async fn live_view(&self) -> Option<ReplicaView> {
        let handle = self.handle.as_ref()?;
        if handle.is_alive().await {
            Some(ReplicaView::new(handle.clone()))
        } else {
            None
        }
    }
}

/// 从库批量命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaCommand {
    Start,
    Stop,
    Reset,
}

impl ReplicaCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaCommand::Start => "start",
            ReplicaCommand::Stop => "stop",
            ReplicaCommand::Reset => "reset",
        }
    }
}

/// GTID 清单中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidRow {
    pub identity: ServerIdentity,
    pub role: ServerRole,
    pub gtid: String,
}

/// executed / purged / owned 三张清单
#[derive(Debug, Clone, Default)]
pub struct GtidInventory {
    pub executed: Vec<GtidRow>,
    pub purged: Vec<GtidRow>,
    pub owned: Vec<GtidRow>,
}

impl GtidInventory {
    /// 三张表依次输出，空表省略
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        for (title, rows) in [
            ("GTID_EXECUTED", &self.executed),
            ("GTID_PURGED", &self.purged),
            ("GTID_OWNED", &self.owned),
        ] {
            if rows.is_empty() {
                continue;
            }
            let cells: Vec<Vec<String>> = rows
                .iter()
                .map(|r| {
                    vec![
                        r.identity.host.clone(),
                        r.identity.port.to_string(),
                        r.role.to_string(),
                        r.gtid.clone(),
                    ]
                })
                .collect();
            out.push(format!(
                "# {} SETS:\n{}",
                title,
                health::render_grid(&["host", "port", "role", "gtid"], &cells)
            ));
        }
        out.join("\n")
    }
}

/// UUID 表
pub fn render_uuids(rows: &[(ServerIdentity, ServerRole, String)]) -> String {
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|(identity, role, uuid)| {
            vec![
                identity.host.clone(),
                identity.port.to_string(),
                role.to_string(),
                uuid.clone(),
            ]
        })
        .collect();
    health::render_grid(&["host", "port", "role", "uuid"], &cells)
}

/// 拓扑状态
#[derive(Debug, Default)]
pub struct TopologyState {
    pub primary: Option<PrimaryRecord>,
    pub replicas: Vec<ReplicaRecord>,
}

/// 拓扑注册表
pub struct TopologyRegistry {
    connector: Arc<dyn Connector>,
    state: TopologyState,
}

impl fmt::Debug for TopologyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyRegistry")
            .field("state", &self.state)
            .finish()
    }
}

impl TopologyRegistry {
    /// 连接主库与从库
    ///
    /// 主库给出时必须连上；从库在非 strict 模式下连接失败只记录为不可达。
    pub async fn connect(
        connector: Arc<dyn Connector>,
        primary: Option<&ConnectionSpec>,
        replicas: &[ConnectionSpec],
        strict: bool,
    ) -> Result<Self> {
        let primary = match primary {
            Some(spec) => {
                let handle = connector.connect(spec).await.map_err(|e| {
                    log::error!("[{}] Cannot connect to master: {}", spec.identity(), e);
                    e
                })?;
                Some(PrimaryRecord {
                    identity: handle.identity(),
                    spec: spec.clone(),
                    view: PrimaryView::new(handle),
                })
            }
            None => None,
        };

        let mut specs = Vec::new();
        for spec in replicas {
            let identity = spec.identity();
            if let Some(p) = &primary {
                if p.identity.same_server(&identity) {
                    log::warn!("[{}] listed as both master and slave, ignoring the slave entry", identity);
                    continue;
                }
            }
            if specs.iter().any(|s: &ConnectionSpec| s.identity().same_server(&identity)) {
                continue;
            }
            specs.push(spec.clone());
        }

        let results = fan_out(
            specs.iter().map(|s| (s.identity(), s.clone())),
            None,
            |spec| {
                let connector = connector.clone();
                async move { connector.connect(&spec).await }
            },
        )
        .await;

        let mut records = Vec::new();
        for (spec, (identity, result)) in specs.into_iter().zip(results) {
            let handle = match result {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let msg = format!(
                        "Cannot connect to slave {} as user '{}'.",
                        identity, spec.credentials.user
                    );
                    if strict {
                        log::error!("{} {}", msg, e);
                        return Err(RplError::ConnectivityError(msg));
                    }
                    log::warn!("{} {}", msg, e);
                    None
                }
            };
            records.push(ReplicaRecord {
                identity,
                spec,
                handle,
                discovered: false,
            });
        }

        Ok(Self {
            connector,
            state: TopologyState {
                primary,
                replicas: records,
            },
        })
    }

    /// 按配置连接，给出 discover 登录时接着发现从库
    ///
    /// 不可达的从库降级为无连接记录 (健康表中显示 DOWN)，主库不可达仍是错误。
    pub async fn from_config(connector: Arc<dyn Connector>, config: &RplConfig) -> Result<Self> {
        let primary = config.primary_spec()?;
        let replicas = config.replica_specs()?;
        let mut registry = Self::connect(connector, primary.as_ref(), &replicas, false).await?;
        if let Some(credentials) = config.discover_credentials()? {
            registry.discover_replicas(&credentials, true).await?;
        }
        Ok(registry)
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn state(&self) -> &TopologyState {
        &self.state
    }

    pub fn primary(&self) -> Option<&PrimaryRecord> {
        self.state.primary.as_ref()
    }

    /// 主库视图，未配置主库视为前置条件失败
    pub fn require_primary(&self) -> Result<&PrimaryRecord> {
        self.primary()
            .ok_or_else(|| RplError::PrerequisiteError("No master specified.".to_string()))
    }

    pub fn replicas(&self) -> &[ReplicaRecord] {
        &self.state.replicas
    }

    pub fn replica(&self, identity: &ServerIdentity) -> Option<&ReplicaRecord> {
        self.state
            .replicas
            .iter()
            .find(|r| r.identity.same_server(identity))
    }

    /// 已连接且存活的从库
    pub async fn live_replicas(&self) -> Vec<(ServerIdentity, ReplicaView)> {
        let mut live = Vec::new();
        for record in &self.state.replicas {
            if let Some(view) = record.live_view().await {
                live.push((record.identity.clone(), view));
            }
        }
        live
    }

    fn is_known(&self, identity: &ServerIdentity) -> bool {
        self.primary()
            .map(|p| p.identity.same_server(identity))
            .unwrap_or(false)
            || self.replica(identity).is_some()
    }

    /// 主库与所有已连接从库都存活
    pub async fn all_connected(&self) -> bool {
        match self.primary() {
            Some(p) if p.view.is_alive().await => {}
            _ => return false,
        }
        for record in &self.state.replicas {
            if let Some(handle) = &record.handle {
                if !handle.is_alive().await {
                    return false;
                }
            }
        }
        true
    }

    pub fn add_replica(&mut self, record: ReplicaRecord) {
        if self.is_known(&record.identity) {
            log::debug!("[{}] already part of the topology", record.identity);
            return;
        }
        self.state.replicas.push(record);
    }

    /// 从注册表中摘除一个从库
    pub fn remove_replica(&mut self, identity: &ServerIdentity) -> Option<ReplicaRecord> {
        let index = self
            .state
            .replicas
            .iter()
            .position(|r| r.identity.same_server(identity))?;
        Some(self.state.replicas.remove(index))
    }

    /// 清除所有发现得到的从库
    pub fn remove_discovered_replicas(&mut self) {
        self.state.replicas.retain(|r| !r.discovered);
    }

    /// 向主库查询公告的从库并接入新成员
    pub async fn discover_replicas(
        &mut self,
        credentials: &Credentials,
        skip_conn_err: bool,
    ) -> Result<bool> {
        let primary = match self.primary() {
            Some(p) => p.clone(),
            None => return Ok(false),
        };
        log::info!("[{}] Discovering slaves for master", primary.identity);

        let mut found = false;
        for advertised in primary.view.advertised_replicas().await? {
            let host = advertised.host.trim();
            if host.is_empty() || host.eq_ignore_ascii_case("unknown host") {
                log::warn!(
                    "[{}] Skipping slave with unregistered host name (server_id {}, port {})",
                    primary.identity,
                    advertised.server_id,
                    advertised.port
                );
                continue;
            }

            let identity = ServerIdentity::new(host, advertised.port);
            if self.is_known(&identity) {
                continue;
            }
            log::info!("[{}] Discovering slave", identity);

            let mut spec = ConnectionSpec::new(credentials.clone(), host, advertised.port);
            spec.ssl = primary.spec.ssl.clone();

            let handle = match self.connector.connect(&spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    let msg = format!(
                        "Cannot connect to slave {} as user '{}'.",
                        identity, credentials.user
                    );
                    if skip_conn_err {
                        log::warn!("{} {}", msg, e);
                        continue;
                    }
                    return Err(RplError::ConnectivityError(msg));
                }
            };

            let view = ReplicaView::new(handle.clone());
            let status = match view.status().await {
                Ok(status) => status,
                Err(e) => {
                    log::warn!("[{}] Slave skipped (cannot read slave status: {})", identity, e);
                    continue;
                }
            };
            match status {
                Some(s) if !s.upstream().same_server(&primary.identity) => {
                    log::warn!(
                        "[{}] Slave skipped (configured for {} instead of {})",
                        identity,
                        s.upstream(),
                        primary.identity
                    );
                }
                Some(s) if !s.io_running() => {
                    log::warn!("[{}] Slave skipped (IO not running)", identity);
                }
                Some(_) => {
                    log::info!("[{}] Found slave", identity);
                    self.state.replicas.push(ReplicaRecord {
                        identity,
                        spec,
                        handle: Some(handle),
                        discovered: true,
                    });
                    found = true;
                }
                None => {
                    log::warn!("[{}] Slave skipped (not acting as a slave)", identity);
                }
            }
        }
        Ok(found)
    }

    /// 连接候选服务器，已知从库复用现有连接
    pub async fn connect_candidate(&self, spec: &ConnectionSpec) -> Result<ServerHandle> {
        if let Some(handle) = self.replica(&spec.identity()).and_then(|r| r.handle.clone()) {
            return Ok(handle);
        }
        self.connector.connect(spec).await
    }

    /// 角色交换
    ///
    /// 候选从从库列表中移出成为主库；旧主库在 `demote_old` 时转为从库。
    /// 返回旧主库记录。
    pub fn swap_roles(
        &mut self,
        candidate: ServerHandle,
        candidate_spec: ConnectionSpec,
        demote_old: bool,
    ) -> Option<PrimaryRecord> {
        let identity = candidate.identity();
        self.remove_replica(&identity);

        let new_primary = PrimaryRecord {
            identity: identity.clone(),
            spec: candidate_spec,
            view: PrimaryView::new(candidate),
        };
        let old = self.state.primary.replace(new_primary);
        log::info!("[{}] now acting as master", identity);

        if let (true, Some(old)) = (demote_old, old.as_ref()) {
            self.state.replicas.push(ReplicaRecord {
                identity: old.identity.clone(),
                spec: old.spec.clone(),
                handle: Some(old.view.handle().clone()),
                discovered: false,
            });
        }
        old
    }

    /// 所有可用服务器 GTID_MODE=ON (不可达成员跳过)
    pub async fn gtid_enabled(&self) -> Result<bool> {
        Ok(self.servers_with_gtid_not_on().await?.is_empty())
    }

    /// GTID_MODE 不为 ON 的可用服务器
    pub async fn servers_with_gtid_not_on(&self) -> Result<Vec<(ServerIdentity, String)>> {
        let mut result = Vec::new();
        if let Some(p) = self.primary() {
            if p.view.is_alive().await {
                let mode = gtid_mode(p.view.handle()).await?;
                if mode != "ON" {
                    result.push((p.identity.clone(), mode));
                }
            }
        }
        for (identity, view) in self.live_replicas().await {
            let mode = gtid_mode(view.handle()).await?;
            if mode != "ON" {
                result.push((identity, mode));
            }
        }
        Ok(result)
    }

    /// 所有从库 master_info_repository 为指定类型
    pub async fn check_master_info_type(&self, repo: &str) -> Result<bool> {
        for record in &self.state.replicas {
            if let Some(handle) = &record.handle {
                let value = handle.variable("master_info_repository").await?;
                if !value
                    .map(|v| v.eq_ignore_ascii_case(repo))
                    .unwrap_or(false)
                {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// 主机名与 IP 地址混用
    pub fn mixes_hostnames_and_ips(&self) -> bool {
        let identities: Vec<&ServerIdentity> = self
            .primary()
            .map(|p| &p.identity)
            .into_iter()
            .chain(self.state.replicas.iter().map(|r| &r.identity))
            .collect();
        let ips = identities.iter().filter(|i| i.is_ip_address()).count();
        ips > 0 && ips < identities.len()
    }

    /// (身份, 角色, server_uuid)
    pub async fn server_uuids(&self) -> Result<Vec<(ServerIdentity, ServerRole, String)>> {
        let mut uuids = Vec::new();
        if let Some(p) = self.primary() {
            uuids.push((p.identity.clone(), ServerRole::Master, p.view.uuid().await?));
        }
        for record in &self.state.replicas {
            if let Some(handle) = &record.handle {
                let uuid = crate::server::view::server_uuid(handle).await?;
                uuids.push((record.identity.clone(), ServerRole::Slave, uuid));
            }
        }
        Ok(uuids)
    }

    async fn server_gtid_data(
        handle: &ServerHandle,
        identity: &ServerIdentity,
        role: ServerRole,
        inventory: &mut GtidInventory,
    ) {
        match gtid_mode(handle).await {
            Ok(mode) if mode == "NO" => return,
            Ok(_) => {}
            Err(e) => {
                log::error!("[{}] ERROR retrieving GTID information: {}", identity, e);
                return;
            }
        }

        let rows = |name: &'static str| async move {
            let text = handle.variable(name).await?.unwrap_or_default();
            let set = GtidSet::parse(&text)?;
            Ok::<_, RplError>(
                set.split_by_uuid()
                    .into_iter()
                    .map(|s| GtidRow {
                        identity: identity.clone(),
                        role,
                        gtid: s.to_string(),
                    })
                    .collect::<Vec<_>>(),
            )
        };

        match (rows("gtid_executed").await, rows("gtid_purged").await) {
            (Ok(executed), Ok(purged)) => {
                inventory.executed.extend(executed);
                inventory.purged.extend(purged);
            }
            (Err(e), _) | (_, Err(e)) => {
                log::error!("[{}] ERROR retrieving GTID information: {}", identity, e);
                return;
            }
        }

        if let Ok(Some(owned)) = handle.variable("gtid_owned").await {
            if !owned.trim().is_empty() {
                inventory.owned.push(GtidRow {
                    identity: identity.clone(),
                    role,
                    gtid: owned.trim().to_string(),
                });
            }
        }
    }

    /// executed / purged / owned 清单
    pub async fn gtid_data(&self) -> GtidInventory {
        let mut inventory = GtidInventory::default();
        if let Some(p) = self.primary() {
            Self::server_gtid_data(p.view.handle(), &p.identity, ServerRole::Master, &mut inventory).await;
        }
        for record in &self.state.replicas {
            if let Some(handle) = &record.handle {
                Self::server_gtid_data(handle, &record.identity, ServerRole::Slave, &mut inventory).await;
            }
        }
        inventory
    }

    /// 各从库缺少的 gtids 子集
    pub async fn replicas_gtid_subtract_executed(&self, gtids: &GtidSet) -> Vec<(ServerIdentity, Result<GtidSet>)> {
        let targets = self
            .state
            .replicas
            .iter()
            .filter_map(|r| r.view().map(|v| (r.identity.clone(), v)));
        fan_out(targets, None, |view| {
            let gtids = gtids.clone();
            async move { Ok(gtids.subtract(&view.gtid_executed().await?)) }
        })
        .await
    }

    /// 在所有从库上并发执行 start / stop / reset，失败只记录警告
    pub async fn run_on_replicas(&self, command: ReplicaCommand, quiet: bool) -> Vec<(ServerIdentity, Result<()>)> {
        log::info!("Performing {} on all slaves", command.as_str().to_uppercase());

        let primary = self.primary().map(|p| p.identity.clone());
        let targets = self
            .state
            .replicas
            .iter()
            .map(|r| (r.identity.clone(), r));
        fan_out(targets, None, |record| {
            let primary = primary.clone();
            async move {
                let identity = record.identity.clone();
                let view = match record.live_view().await {
                    Some(v) => v,
                    None => {
                        log::warn!("[{}] Executing {} on slave: WARN - cannot connect to slave", identity, command.as_str());
                        return Err(RplError::ConnectivityError(format!("Cannot connect to slave {}.", identity)));
                    }
                };

                if let Some(primary) = &primary {
                    match view.is_configured_for(primary).await {
                        Ok(true) => {}
                        Ok(false) if !quiet => {
                            log::warn!("[{}] WARN - slave is not configured with this master", identity)
                        }
                        Ok(false) => {}
                        Err(e) => log::warn!("[{}] Cannot read slave status before {}: {}", identity, command.as_str(), e),
                    }
                }

                let result = match command {
                    ReplicaCommand::Start => view.start().await,
                    ReplicaCommand::Stop => view.stop().await,
                    ReplicaCommand::Reset => match view.stop().await {
                        Ok(()) => view.reset().await,
                        Err(e) => Err(e),
                    },
                };
                match &result {
                    Ok(()) if !quiet => log::info!("[{}] Executing {} on slave: Ok", identity, command.as_str()),
                    Err(e) if !quiet => log::warn!(
                        "[{}] Executing {} on slave: WARN - slave failed to {}: {}",
                        identity,
                        command.as_str(),
                        command.as_str(),
                        e
                    ),
                    _ => {}
                }
                result
            }
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::lab::{LabCluster, LabServer};

    pub fn root() -> Credentials {
        Credentials::new("root", Some("root".to_string()))
    }

    pub fn rpl() -> Credentials {
        Credentials::new("rpl", Some("rpl".to_string()))
    }

    pub fn spec(host: &str) -> ConnectionSpec {
        ConnectionSpec::new(root(), host, 3306)
    }

    /// p 为主库，其余挂在 p 下并提交 `transactions` 个事务
    pub fn star(primary: &str, replicas: &[&str], transactions: u64) -> LabCluster {
        let cluster = LabCluster::new();
        let p = cluster.add_server(LabServer::new(primary, 3306, 1));
        for (i, host) in replicas.iter().enumerate() {
            let r = cluster.add_server(LabServer::new(host, 3306, i as u32 + 2));
            cluster.attach(&r, &p, &rpl()).unwrap();
        }
        if transactions > 0 {
            cluster.commit(&p, transactions).unwrap();
        }
        cluster
    }

    pub async fn registry(cluster: &LabCluster, primary: Option<&str>, replicas: &[&str]) -> TopologyRegistry {
        let replica_specs: Vec<_> = replicas.iter().map(|h| spec(h)).collect();
        TopologyRegistry::connect(
            Arc::new(cluster.connector()),
            primary.map(spec).as_ref(),
            &replica_specs,
            false,
        )
        .await
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::lab::LabServer;
    use crate::server::connection::MockServerConnection;

    #[tokio::test]
    async fn test_connect_degrades_unreachable_replica() {
        let cluster = star("p", &["r1", "r2"], 3);
        cluster.set_alive(&ServerIdentity::new("r2", 3306), false);

        let registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;
        assert_eq!(registry.replicas().len(), 2);
        assert!(registry.replicas()[0].handle.is_some());
        assert!(registry.replicas()[1].handle.is_none());

        let strict = TopologyRegistry::connect(
            Arc::new(cluster.connector()),
            Some(&spec("p")),
            &[spec("r1"), spec("r2")],
            true,
        )
        .await;
        assert!(matches!(strict, Err(RplError::ConnectivityError(_))));
    }

    #[tokio::test]
    async fn test_from_config_reports_dead_replica_as_down() {
        let cluster = star("p", &["r1", "r2"], 2);
        let r2 = ServerIdentity::new("r2", 3306);
        cluster.set_alive(&r2, false);

        let config = RplConfig {
            primary: Some("root:root@p".to_string()),
            replicas: vec!["root:root@r1".to_string(), "root:root@r2".to_string()],
            ..RplConfig::default()
        };
        assert!(!config.force);
        let registry = TopologyRegistry::from_config(Arc::new(cluster.connector()), &config)
            .await
            .unwrap();
        assert_eq!(registry.replicas().len(), 2);

        let report = registry.health(&HealthThresholds::from_config(&config)).await;
        let row = report.row(&r2).unwrap();
        assert_eq!(row.state, ServerState::Down);
        assert_eq!(report.row(&ServerIdentity::new("r1", 3306)).unwrap().state, ServerState::Up);
    }

    #[tokio::test]
    async fn test_missing_primary_is_fatal() {
        let cluster = star("p", &["r1"], 0);
        cluster.set_alive(&ServerIdentity::new("p", 3306), false);
        let result = TopologyRegistry::connect(Arc::new(cluster.connector()), Some(&spec("p")), &[spec("r1")], false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_discover_replicas() {
        let cluster = star("p", &["r1", "r2", "r3"], 2);
        let mut registry = registry(&cluster, Some("p"), &["r1"]).await;

        assert!(registry.discover_replicas(&root(), true).await.unwrap());
        assert_eq!(registry.replicas().len(), 3);
        assert!(registry.replicas()[1].discovered);

        // 再次发现不会重复加入
        assert!(!registry.discover_replicas(&root(), true).await.unwrap());

        registry.remove_discovered_replicas();
        assert_eq!(registry.replicas().len(), 1);
        assert_eq!(registry.replicas()[0].identity.host, "r1");
    }

    #[tokio::test]
    async fn test_discover_skips_empty_host() {
        let cluster = star("p", &["r1", "r2"], 1);
        cluster.update(&ServerIdentity::new("r2", 3306), |s| s.report_host = Some(String::new()));

        let mut registry = registry(&cluster, Some("p"), &[]).await;
        assert!(registry.discover_replicas(&root(), true).await.unwrap());
        assert_eq!(registry.replicas().len(), 1);
        assert_eq!(registry.replicas()[0].identity.host, "r1");
    }

    #[tokio::test]
    async fn test_discover_connection_error_handling() {
        let cluster = star("p", &["r1"], 1);
        let mut registry = registry(&cluster, Some("p"), &[]).await;
        let wrong = Credentials::new("root", Some("bad".into()));

        assert!(!registry.discover_replicas(&wrong, true).await.unwrap());
        assert!(registry.discover_replicas(&wrong, false).await.is_err());
    }

    /// r2 接受连接但读取复制状态失败
    struct StatusErrorConnector {
        inner: crate::lab::LabConnector,
        host: &'static str,
    }

    #[async_trait::async_trait]
    impl Connector for StatusErrorConnector {
        async fn connect(&self, spec: &ConnectionSpec) -> Result<ServerHandle> {
            if spec.host != self.host {
                return self.inner.connect(spec).await;
            }
            let mut mock = MockServerConnection::new();
            let identity = spec.identity();
            mock.expect_identity().returning(move || identity.clone());
            mock.expect_replica_status()
                .returning(|| Err(RplError::ConnectivityError("Lost connection during query".into())));
            Ok(Arc::new(mock))
        }
    }

    #[tokio::test]
    async fn test_discover_skips_replica_with_unreadable_status() {
        let cluster = star("p", &["r1", "r2", "r3"], 1);
        let connector = StatusErrorConnector {
            inner: cluster.connector(),
            host: "r2",
        };
        let mut registry = TopologyRegistry::connect(Arc::new(connector), Some(&spec("p")), &[], false)
            .await
            .unwrap();

        assert!(registry.discover_replicas(&root(), false).await.unwrap());
        let hosts: Vec<_> = registry.replicas().iter().map(|r| r.identity.host.clone()).collect();
        assert_eq!(hosts, vec!["r1", "r3"]);
    }

    #[tokio::test]
    async fn test_swap_roles_with_demote() {
        let cluster = star("p", &["r1", "r2"], 1);
        let mut registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;

        let candidate = registry.replicas()[0].handle.clone().unwrap();
        let old = registry.swap_roles(candidate, spec("r1"), true).unwrap();
        assert_eq!(old.identity.host, "p");
        assert_eq!(registry.primary().unwrap().identity.host, "r1");

        let hosts: Vec<_> = registry.replicas().iter().map(|r| r.identity.host.clone()).collect();
        assert_eq!(hosts, vec!["r2", "p"]);
    }

    #[tokio::test]
    async fn test_gtid_and_repository_checks() {
        let cluster = star("p", &["r1"], 1);
        cluster.add_server(LabServer {
            gtid_mode: false,
            master_info_repository: "FILE".into(),
            ..LabServer::new("r2", 3306, 9)
        });
        let registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;

        assert!(!registry.gtid_enabled().await.unwrap());
        let off = registry.servers_with_gtid_not_on().await.unwrap();
        assert_eq!(off, vec![(ServerIdentity::new("r2", 3306), "OFF".to_string())]);
        assert!(!registry.check_master_info_type("TABLE").await.unwrap());
    }

    #[tokio::test]
    async fn test_gtid_inventory_and_uuids() {
        let cluster = star("p", &["r1"], 4);
        let registry = registry(&cluster, Some("p"), &["r1"]).await;

        let inventory = registry.gtid_data().await;
        assert_eq!(inventory.executed.len(), 2);
        assert!(inventory.purged.is_empty());
        assert_eq!(inventory.executed[0].role, ServerRole::Master);

        let uuids = registry.server_uuids().await.unwrap();
        assert_eq!(uuids.len(), 2);
        assert_ne!(uuids[0].2, uuids[1].2);

        let text = inventory.render();
        assert!(text.contains("# GTID_EXECUTED SETS:"));
        assert!(!text.contains("GTID_PURGED"));
        assert!(render_uuids(&uuids).contains("MASTER"));
    }

    #[tokio::test]
    async fn test_run_on_replicas() {
        let cluster = star("p", &["r1", "r2"], 1);
        let registry = registry(&cluster, Some("p"), &["r1", "r2"]).await;

        let results = registry.run_on_replicas(ReplicaCommand::Stop, true).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        let r1 = cluster.server(&ServerIdentity::new("r1", 3306)).unwrap();
        assert!(!r1.sql_running);

        let results = registry.run_on_replicas(ReplicaCommand::Start, true).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        let r1 = cluster.server(&ServerIdentity::new("r1", 3306)).unwrap();
        assert!(r1.sql_running);

        // 结果按注册顺序返回，不可达的从库单独报错
        cluster.set_alive(&ServerIdentity::new("r1", 3306), false);
        let results = registry.run_on_replicas(ReplicaCommand::Stop, false).await;
        assert_eq!(results[0].0.host, "r1");
        assert!(matches!(results[0].1, Err(RplError::ConnectivityError(_))));
        assert_eq!(results[1].0.host, "r2");
        assert!(results[1].1.is_ok());
        assert!(!cluster.server(&ServerIdentity::new("r2", 3306)).unwrap().sql_running);
    }

    #[tokio::test]
    async fn test_mixed_hostnames_and_ips() {
        let cluster = star("10.0.0.1", &["db2"], 0);
        let mixed = registry(&cluster, Some("10.0.0.1"), &["db2"]).await;
        assert!(mixed.mixes_hostnames_and_ips());

        let cluster = star("db1", &["db2"], 0);
        let plain = registry(&cluster, Some("db1"), &["db2"]).await;
        assert!(!plain.mixes_hostnames_and_ips());
    }
}
