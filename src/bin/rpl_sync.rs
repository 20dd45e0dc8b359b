//! rpl_sync 复制数据一致性检查
//!
//! 先比较 GTID 同步状态，再在同步点上逐表比较定义与校验和。
//! 发现不一致时以退出码 1 结束。

use clap::Parser;
use rpladmin::sync::{ConsistencyChecker, SyncOptions};
use rpladmin::utils::cli::split_list;
use rpladmin::utils::CommonArgs;
use rpladmin::{RplConfig, TopologyRegistry};

#[derive(Parser, Debug)]
#[command(name = "rpl_sync", version, about = "Replication data consistency checker")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, visible_alias = "primary")]
    master: Option<String>,

    #[arg(long, visible_alias = "replicas", value_delimiter = ',')]
    slaves: Vec<String>,

    #[arg(long, visible_alias = "discover-replicas-login")]
    discover_slaves_login: Option<String>,

    /// 只检查这些 db 或 db.table，逗号分隔
    #[arg(long, value_delimiter = ',')]
    databases: Vec<String>,

    /// 排除这些 db 或 db.table，逗号分隔
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// 等待从库追平同步点的超时 (秒)
    #[arg(long)]
    rpl_timeout: Option<u64>,

    /// 单表校验和超时 (秒)
    #[arg(long)]
    checksum_timeout: Option<u64>,

    /// 轮询间隔 (秒)
    #[arg(long)]
    interval: Option<u64>,
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
        if self.discover_slaves_login.is_some() {
            config.discover = self.discover_slaves_login.clone();
        }
        if !self.databases.is_empty() {
            config.include = split_list(&self.databases);
        }
        if !self.exclude.is_empty() {
            config.exclude = split_list(&self.exclude);
        }
        if let Some(timeout) = self.rpl_timeout {
            config.rpl_timeout = timeout;
        }
        if let Some(timeout) = self.checksum_timeout {
            config.checksum_timeout = timeout;
        }
        if let Some(interval) = self.interval {
            config.sync_interval = interval;
        }
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
    if config.primary.is_none() && config.replicas.is_empty() {
        anyhow::bail!("at least one of --master or --slaves is required");
    }

    let connector = cli.common.connector()?;
    let registry = TopologyRegistry::from_config(connector, &config).await?;

    let mut checker = ConsistencyChecker::new(&registry, SyncOptions::from_config(&config)?).await?;
    let report = checker.run().await?;
    print!("{}", report.render());

    if !report.is_consistent() {
        std::process::exit(1);
    }
    Ok(())
}
