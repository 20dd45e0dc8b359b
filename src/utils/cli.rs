//! 命令行公共部分
//!
//! 四个可执行程序共用：配置文件、模拟拓扑、日志级别、复制账号与 SSL。

use crate::lab::LabCluster;
use crate::server::Connector;
use crate::utils::config::RplConfig;
use crate::{Result, RplError};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

/// 公共参数
#[derive(Debug, Clone, Default, Args)]
pub struct CommonArgs {
    /// 配置文件 (缺省读取 config/rpl.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 模拟拓扑文件 (TOML)
    #[arg(long)]
    pub lab: Option<PathBuf>,

    /// 复制账号 user[:password]
    #[arg(long)]
    pub rpl_user: Option<String>,

    /// 输出调试日志 (可重复)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// 只输出警告与错误
    #[arg(short, long)]
    pub quiet: bool,

    #[arg(long)]
    pub ssl_ca: Option<String>,
    #[arg(long)]
    pub ssl_cert: Option<String>,
    #[arg(long)]
    pub ssl_key: Option<String>,
}

impl CommonArgs {
    /// 加载配置文件并用命令行覆盖
    pub fn load_config(&self) -> Result<RplConfig> {
        let mut config = match &self.config {
            Some(path) => RplConfig::load_from_file(path)?,
            None => RplConfig::load_default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut RplConfig) {
        if let Some(user) = &self.rpl_user {
            config.rpl_user = Some(user.clone());
        }
        if self.verbose > 0 {
            config.verbosity = self.verbose;
        }
        if self.quiet {
            config.quiet = true;
        }
        if self.ssl_ca.is_some() {
            config.ssl_ca = self.ssl_ca.clone();
        }
        if self.ssl_cert.is_some() {
            config.ssl_cert = self.ssl_cert.clone();
        }
        if self.ssl_key.is_some() {
            config.ssl_key = self.ssl_key.clone();
        }
    }

    /// 日志级别：-v 为 debug，-q 为 warn，默认 info；RUST_LOG 优先
    pub fn log_level(&self) -> &'static str {
        if self.verbose > 0 {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    pub fn init_logging(&self) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(self.log_level())).init();
    }

    /// 打开驱动；目前只有模拟后端
    pub fn connector(&self) -> Result<Arc<dyn Connector>> {
        match &self.lab {
            Some(path) => {
                let cluster = LabCluster::from_file(path)?;
                log::info!("Using lab topology from {}", path.display());
                Ok(Arc::new(cluster.connector()))
            }
            None => Err(RplError::ConfigError(
                "no server driver available; pass --lab <topology.toml> to run against a \
                 simulated topology"
                    .to_string(),
            )),
        }
    }
}

/// 逗号分隔的参数展开为列表
pub fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
