//! 管理命令分发
//!
//! health / gtid / start / stop / reset / elect / switchover / failover
//!
//! 所有命令先检查登录账号权限：elect、switchover、failover 需要完整的管理权限，
//! 其余命令只需要 SUPER。switchover 与 failover 完成后默认输出健康表。

use crate::failover::{FailoverEngine, FailoverOptions, RoleChangeOutcome};
use crate::server::{ConnectionSpec, ServerIdentity};
use crate::topology::{render_uuids, HealthReport, HealthThresholds, ReplicaCommand, TopologyRegistry};
use crate::utils::config::RplConfig;
use crate::{Result, RplError};
use std::fmt;
use std::str::FromStr;

/// 主机名与 IP 混用的提示
pub const HOST_IP_WARNING: &str = "There are slaves that had been configured with a hostname \
    while others with an IP address. Mixing hostnames and IP addresses is not recommended.";

/// 管理命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Health,
    Gtid,
    Start,
    Stop,
    Reset,
    Elect,
    Switchover { new_primary: ConnectionSpec },
    Failover,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Health => "health",
            Command::Gtid => "gtid",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Reset => "reset",
            Command::Elect => "elect",
            Command::Switchover { .. } => "switchover",
            Command::Failover => "failover",
        }
    }

    /// 需要完整管理权限
    pub fn needs_admin_privileges(&self) -> bool {
        matches!(self, Command::Elect | Command::Switchover { .. } | Command::Failover)
    }

    pub fn is_role_change(&self) -> bool {
        matches!(self, Command::Switchover { .. } | Command::Failover)
    }

    /// 由命令名与 `--new-master` 构造
    pub fn parse(name: &str, new_primary: Option<ConnectionSpec>) -> Result<Self> {
        if name.eq_ignore_ascii_case("switchover") {
            return match new_primary {
                Some(spec) => Ok(Command::Switchover { new_primary: spec }),
                None => Err(RplError::InvalidParameter(
                    "The switchover command requires --new-master.".to_string(),
                )),
            };
        }
        name.parse()
    }
}

impl FromStr for Command {
    type Err = RplError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "health" => Ok(Command::Health),
            "gtid" => Ok(Command::Gtid),
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "reset" => Ok(Command::Reset),
            "elect" => Ok(Command::Elect),
            "failover" => Ok(Command::Failover),
            "switchover" => Err(RplError::InvalidParameter(
                "The switchover command requires --new-master.".to_string(),
            )),
            other => Err(RplError::InvalidParameter(format!(
                "'{}' is not a valid command.",
                other
            ))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 命令执行结果
#[derive(Debug, Default)]
pub struct CommandOutcome {
    /// 供终端输出的报告文本
    pub output: String,
    pub warnings: Vec<String>,
    /// elect 选出的候选
    pub elected: Option<ServerIdentity>,
    pub role_change: Option<RoleChangeOutcome>,
    /// start / stop / reset 失败的从库
    pub failed_replicas: Vec<ServerIdentity>,
    /// 最后一次生成的健康表
    pub health: Option<HealthReport>,
}

impl CommandOutcome {
    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.warnings.push(message);
    }
}

/// 命令分发器
pub struct Admin {
    engine: FailoverEngine,
    candidates: Vec<ConnectionSpec>,
    thresholds: HealthThresholds,
    quiet: bool,
    no_health: bool,
}

impl Admin {
    pub fn from_config(config: &RplConfig) -> Result<Self> {
        Self::new(config, FailoverOptions::from_config(config)?)
    }

    pub fn new(config: &RplConfig, options: FailoverOptions) -> Result<Self> {
        Ok(Self {
            engine: FailoverEngine::new(options),
            candidates: config.candidate_specs()?,
            thresholds: HealthThresholds::from_config(config),
            quiet: config.quiet,
            no_health: config.no_health,
        })
    }

    pub fn engine(&self) -> &FailoverEngine {
        &self.engine
    }

    /// 执行一条命令
    pub async fn execute(&mut self, registry: &mut TopologyRegistry, command: &Command) -> Result<CommandOutcome> {
        let mut outcome = CommandOutcome::default();

        self.check_privileges(registry, command).await?;
        log::info!("Executing {} command...", command);

        match command {
            Command::Health => {
                let text = self.health(registry, &mut outcome).await;
                outcome.output = text;
            }
            Command::Gtid => outcome.output = self.gtid(registry).await?,
            Command::Start => self.on_replicas(registry, ReplicaCommand::Start, &mut outcome).await,
            Command::Stop => self.on_replicas(registry, ReplicaCommand::Stop, &mut outcome).await,
            Command::Reset => self.on_replicas(registry, ReplicaCommand::Reset, &mut outcome).await,
            Command::Elect => self.elect(registry, &mut outcome).await?,
            Command::Switchover { new_primary } => {
                registry.require_primary()?;
                self.check_host_references(registry, &mut outcome);
                if self.engine.options().rpl_user.is_none() {
                    self.require_table_repository(registry).await?;
                }
                log::info!(
                    "Performing switchover from master at {} to slave at {}.",
                    registry.require_primary()?.identity,
                    new_primary.identity()
                );
                let result = self.engine.switchover(registry, new_primary).await?;
                outcome.warnings.extend(result.warnings.iter().cloned());
                outcome.role_change = Some(result);
            }
            Command::Failover => {
                self.check_host_references(registry, &mut outcome);
                self.require_table_repository(registry).await?;
                log::info!("Performing failover.");
                let result = self.engine.failover(registry, &self.candidates, false).await?;
                outcome.warnings.extend(result.warnings.iter().cloned());
                outcome.role_change = Some(result);
            }
        }

        if command.is_role_change() && !self.no_health {
            let report = self.health(registry, &mut outcome).await;
            if !outcome.output.is_empty() {
                outcome.output.push('\n');
            }
            outcome.output.push_str(&report);
        }
        log::info!("...done.");
        Ok(outcome)
    }

    async fn check_privileges(&self, registry: &TopologyRegistry, command: &Command) -> Result<()> {
        log::info!("Checking privileges.");
        let candidates: Vec<ConnectionSpec> = match command {
            Command::Switchover { new_primary } => vec![new_primary.clone()],
            Command::Elect | Command::Failover => self.candidates.clone(),
            _ => Vec::new(),
        };
        // 故障转移时主库通常已不可达
        let skip_primary = match (command, registry.primary()) {
            (Command::Failover, Some(p)) => !p.view.is_alive().await,
            _ => false,
        };

        let findings = registry
            .check_privileges(command.needs_admin_privileges(), skip_primary, &candidates)
            .await?;
        if findings.is_empty() {
            return Ok(());
        }
        for finding in &findings {
            log::error!(
                "User {} on {} does not have sufficient privileges to execute the {} command.",
                finding.user,
                finding.identity,
                command
            );
        }
        let detail: Vec<String> = findings.iter().map(|f| f.describe()).collect();
        Err(RplError::PrerequisiteError(format!(
            "Not enough privileges to execute command. {}",
            detail.join(" ")
        )))
    }

    fn check_host_references(&self, registry: &TopologyRegistry, outcome: &mut CommandOutcome) {
        if registry.mixes_hostnames_and_ips() {
            outcome.warn(HOST_IP_WARNING);
        }
    }

    async fn require_table_repository(&self, registry: &TopologyRegistry) -> Result<()> {
        if registry.check_master_info_type("TABLE").await? {
            return Ok(());
        }
        let message = "You must specify either the --rpl-user or set all slaves to use \
                       --master-info-repository=TABLE."
            .to_string();
        log::error!("{}", message);
        Err(RplError::PrerequisiteError(message))
    }

    async fn health(&self, registry: &TopologyRegistry, outcome: &mut CommandOutcome) -> String {
        let report = registry.health(&self.thresholds).await;
        let text = format!("# Replication Topology Health:\n{}", report.render());
        outcome.health = Some(report);
        text
    }

    async fn gtid(&self, registry: &TopologyRegistry) -> Result<String> {
        let mut output = registry.gtid_data().await.render();
        let uuids = registry.server_uuids().await?;
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str("# UUIDS for all servers:\n");
        output.push_str(&render_uuids(&uuids));
        Ok(output)
    }

    async fn on_replicas(&self, registry: &TopologyRegistry, command: ReplicaCommand, outcome: &mut CommandOutcome) {
        let results = registry.run_on_replicas(command, self.quiet).await;
        outcome.failed_replicas = results
            .into_iter()
            .filter(|(_, r)| r.is_err())
            .map(|(identity, _)| identity)
            .collect();
    }

    async fn elect(&self, registry: &TopologyRegistry, outcome: &mut CommandOutcome) -> Result<()> {
        if !registry.gtid_enabled().await? {
            outcome.warn(
                "Topology must support global transaction ids and have GTID_MODE=ON for slave election.",
            );
            return Ok(());
        }
        self.check_host_references(registry, outcome);

        if self.candidates.is_empty() {
            log::info!("Electing candidate slave from known slaves.");
        } else {
            log::info!("Electing candidate slave from candidate list then slaves list.");
        }
        match self
            .engine
            .checker()
            .find_best(registry, &self.candidates, true, false)
            .await?
        {
            Some(best) => {
                log::info!("Best slave found is located on {}.", best.identity);
                outcome.output = format!("# Best slave found is located on {}.\n", best.identity);
                outcome.elected = Some(best.identity);
            }
            None => {
                log::error!("No slave found that meets eligibility requirements.");
                outcome.output = "# No slave found that meets eligibility requirements.\n".to_string();
            }
        }
        Ok(())
    }
}
