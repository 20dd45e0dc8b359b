//! rpl_ms 多源轮转复制
//!
//! 一个从库按时间片在多个主库之间轮转复制。

use clap::Parser;
use rpladmin::multisource::MultiSourceScheduler;
use rpladmin::server::ConnectionSpec;
use rpladmin::utils::cli::split_list;
use rpladmin::utils::{CommonArgs, ReportValue};
use rpladmin::RplConfig;

#[derive(Parser, Debug)]
#[command(name = "rpl_ms", version, about = "Round-robin multi-source replication")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// 从库连接串
    #[arg(long)]
    slave: String,

    /// 主库连接串，逗号分隔，按顺序轮转
    #[arg(long, value_delimiter = ',', required = true)]
    masters: Vec<String>,

    /// 每个主库的复制时间片 (秒)
    #[arg(long)]
    switchover_interval: Option<u64>,

    /// 报告间隔 (秒)
    #[arg(long)]
    interval: Option<u64>,

    /// 逗号分隔：health, gtid, uuid
    #[arg(long)]
    report_values: Option<String>,

    #[arg(long)]
    pedantic: bool,
}

impl Cli {
    fn apply(&self, config: &mut RplConfig) -> rpladmin::Result<()> {
        self.common.apply(config);
        if let Some(slice) = self.switchover_interval {
            config.switchover_interval = slice;
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(values) = &self.report_values {
            config.report_values = ReportValue::parse_list(values)?;
        }
        config.pedantic |= self.pedantic;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging();
    rpladmin::observability::init_metrics();

    let mut config = cli.common.load_config()?;
    cli.apply(&mut config)?;
    config.validate()?;

    let replica: ConnectionSpec = cli.slave.parse()?;
    let primaries = split_list(&cli.masters)
        .iter()
        .map(|m| m.parse::<ConnectionSpec>())
        .collect::<rpladmin::Result<Vec<_>>>()?;

    let connector = cli.common.connector()?;
    let mut scheduler = MultiSourceScheduler::connect(connector, primaries, replica, &config).await?;
    scheduler.run().await?;
    Ok(())
}
