//! rpl_failover 自动故障转移守护进程
//!
//! 周期检查主库存活，主库丢失时按 failover_mode 选主并重建拓扑。

use clap::Parser;
use rpladmin::failover::FailoverDaemon;
use rpladmin::utils::cli::split_list;
use rpladmin::utils::{CommonArgs, FailoverMode};
use rpladmin::{RplConfig, TopologyRegistry};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rpl_failover", version, about = "Automatic replication failover daemon")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, visible_alias = "primary")]
    master: Option<String>,

    #[arg(long, visible_alias = "replicas", value_delimiter = ',')]
    slaves: Vec<String>,

    #[arg(long, visible_alias = "candidate", value_delimiter = ',')]
    candidates: Vec<String>,

    #[arg(long, visible_alias = "discover-replicas-login")]
    discover_slaves_login: Option<String>,

    /// auto | elect | fail
    #[arg(long)]
    failover_mode: Option<FailoverMode>,

    /// 检查间隔 (秒)
    #[arg(long)]
    interval: Option<u64>,

    /// 存活探测等待 (秒)
    #[arg(long)]
    ping: Option<u64>,

    /// 外部存活探测脚本
    #[arg(long)]
    exec_fail_check: Option<PathBuf>,

    #[arg(long)]
    exec_before: Option<PathBuf>,

    #[arg(long)]
    exec_after: Option<PathBuf>,

    #[arg(long)]
    exec_post_failover: Option<PathBuf>,

    #[arg(long)]
    script_threshold: Option<i32>,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    pedantic: bool,

    #[arg(long)]
    no_health: bool,
}

impl Cli {
    fn apply(&self, config: &mut RplConfig) {
        self.common.apply(config);
        if self.master.is_some() {
            config.primary = self.master.clone();
        }
        if !self.slaves.is_empty() {
            config.replicas = split_list(&self.slaves);
        }
        if !self.candidates.is_empty() {
            config.candidates = split_list(&self.candidates);
        }
        if self.discover_slaves_login.is_some() {
            config.discover = self.discover_slaves_login.clone();
        }
        if let Some(mode) = self.failover_mode {
            config.failover_mode = mode;
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(ping) = self.ping {
            config.ping = ping;
        }
        let scripts = [
            (&self.exec_fail_check, &mut config.exec_fail),
            (&self.exec_before, &mut config.before),
            (&self.exec_after, &mut config.after),
            (&self.exec_post_failover, &mut config.post_fail),
        ];
        for (arg, slot) in scripts {
            if arg.is_some() {
                *slot = arg.clone();
            }
        }
        if self.script_threshold.is_some() {
            config.script_threshold = self.script_threshold;
        }
        config.force |= self.force;
        config.pedantic |= self.pedantic;
        config.no_health |= self.no_health;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging();
    rpladmin::observability::init_metrics();

    let mut config = cli.common.load_config()?;
    cli.apply(&mut config);
    config.validate()?;
    if config.primary.is_none() {
        anyhow::bail!("--master is required");
    }

    let connector = cli.common.connector()?;
    let mut registry = TopologyRegistry::from_config(connector, &config).await?;

    let mut daemon = FailoverDaemon::from_config(&config)?;
    daemon.run(&mut registry).await?;
    Ok(())
}
