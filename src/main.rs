//! rpl-admin 复制拓扑管理命令
//!
//! ```text
//! rpl-admin --lab demos/topology.toml --master root:root@db1 --discover-slaves-login root:root health
//! rpl-admin --master root:root@db1 --slaves root:root@db2,root:root@db3 \
//!     --new-master root:root@db2 --demote-master --rpl-user rpl:rpl switchover
//! ```

use clap::Parser;
use rpladmin::admin::{Admin, Command};
use rpladmin::server::ConnectionSpec;
use rpladmin::utils::cli::split_list;
use rpladmin::utils::CommonArgs;
use rpladmin::TopologyRegistry;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rpl-admin", version, about = "Replication topology administration")]
struct Cli {
    /// health | gtid | start | stop | reset | elect | switchover | failover
    command: String,

    #[command(flatten)]
    common: CommonArgs,

    /// 主库连接串 user[:pass]@host[:port]
    #[arg(long, visible_alias = "primary")]
    master: Option<String>,

    /// 从库连接串，逗号分隔
    #[arg(long, visible_alias = "replicas", value_delimiter = ',')]
    slaves: Vec<String>,

    /// switchover 的新主库
    #[arg(long)]
    new_master: Option<String>,

    /// 候选列表，逗号分隔
    #[arg(long, visible_alias = "candidate", value_delimiter = ',')]
    candidates: Vec<String>,

    /// 通过主库发现从库时使用的登录 user[:pass]
    #[arg(long, visible_alias = "discover-replicas-login")]
    discover_slaves_login: Option<String>,

    /// 忽略从库不可达等非致命问题
    #[arg(long)]
    force: bool,

    /// 切换后把旧主库挂到新主库下
    #[arg(long)]
    demote_master: bool,

    /// 切换后不输出健康表
    #[arg(long)]
    no_health: bool,

    /// 严格比较过滤规则与 binlog 位点
    #[arg(long)]
    pedantic: bool,

    /// 允许的最大复制延迟 (秒)
    #[arg(long, visible_alias = "max-delay")]
    max_lag: Option<u64>,

    #[arg(long)]
    max_position: Option<u64>,

    /// 等待追平的超时 (秒)
    #[arg(long)]
    timeout: Option<u64>,

    /// 存活探测等待 (秒)
    #[arg(long)]
    ping: Option<u64>,

    /// 角色切换前执行的脚本
    #[arg(long)]
    before: Option<PathBuf>,

    /// 角色切换后执行的脚本
    #[arg(long)]
    after: Option<PathBuf>,

    /// 健康表以 JSON 输出
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn apply(&self, config: &mut rpladmin::RplConfig) {
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
        config.force |= self.force;
        config.demote |= self.demote_master;
        config.no_health |= self.no_health;
        config.pedantic |= self.pedantic;
        if let Some(max_lag) = self.max_lag {
            config.max_delay = max_lag;
        }
        if let Some(max_position) = self.max_position {
            config.max_position = max_position;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(ping) = self.ping {
            config.ping = ping;
        }
        if self.before.is_some() {
            config.before = self.before.clone();
        }
        if self.after.is_some() {
            config.after = self.after.clone();
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

    let new_primary = cli
        .new_master
        .as_deref()
        .map(str::parse::<ConnectionSpec>)
        .transpose()?;
    let command = Command::parse(&cli.command, new_primary)?;
    log::debug!("Executing command '{}'", command);

    let connector = cli.common.connector()?;
    let mut registry = TopologyRegistry::from_config(connector, &config).await?;

    let mut admin = Admin::from_config(&config)?;
    let outcome = admin.execute(&mut registry, &command).await?;
    match (&outcome.health, cli.json) {
        (Some(report), true) => println!("{}", report.to_json()?),
        _ if !outcome.output.is_empty() => println!("{}", outcome.output),
        _ => {}
    }
    for warning in &outcome.warnings {
        eprintln!("# WARNING: {}", warning);
    }

    if !outcome.failed_replicas.is_empty() {
        let failed: Vec<String> = outcome.failed_replicas.iter().map(|s| s.to_string()).collect();
        anyhow::bail!("command '{}' failed on: {}", command, failed.join(", "));
    }
    Ok(())
}
