//! Prometheus 指标导出模块
//!
//! - 角色变更次数与耗时
//! - 健康检查次数、异常从库数
//! - 错误事务数
//! - 一致性检查发现的问题数

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// 角色变更次数 (kind: switchover/failover/multisource, result: ok/aborted)
    pub static ref ROLE_CHANGE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("role_change_total", "Total number of role changes attempted")
            .namespace("rpl"),
        &["kind", "result"]
    ).expect("Failed to create ROLE_CHANGE_TOTAL metric");

    /// 角色变更耗时 (秒)
    pub static ref ROLE_CHANGE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("role_change_duration_seconds", "Role change duration in seconds")
            .namespace("rpl")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["kind"]
    ).expect("Failed to create ROLE_CHANGE_DURATION metric");

    /// 健康检查次数
    pub static ref HEALTH_CHECK_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("health_check_total", "Total number of health table evaluations")
            .namespace("rpl")
    ).expect("Failed to create HEALTH_CHECK_TOTAL metric");

    /// 最近一次健康检查中不健康的从库数
    pub static ref REPLICAS_UNHEALTHY: IntGauge = IntGauge::with_opts(
        Opts::new("replicas_unhealthy", "Replicas reported unhealthy by the last health check")
            .namespace("rpl")
    ).expect("Failed to create REPLICAS_UNHEALTHY metric");

    /// 最近一次检测到的错误事务数
    pub static ref ERRANT_TRANSACTIONS: IntGauge = IntGauge::with_opts(
        Opts::new("errant_transactions", "Errant transactions found by the last check")
            .namespace("rpl")
    ).expect("Failed to create ERRANT_TRANSACTIONS metric");

    /// 一致性问题累计数
    pub static ref SYNC_ISSUES_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("sync_issues_total", "Data consistency issues found")
            .namespace("rpl")
    ).expect("Failed to create SYNC_ISSUES_TOTAL metric");
}

/// 初始化所有指标到 Registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(ROLE_CHANGE_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ROLE_CHANGE_DURATION.clone())).ok();
    REGISTRY.register(Box::new(HEALTH_CHECK_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(REPLICAS_UNHEALTHY.clone())).ok();
    REGISTRY.register(Box::new(ERRANT_TRANSACTIONS.clone())).ok();
    REGISTRY.register(Box::new(SYNC_ISSUES_TOTAL.clone())).ok();

    log::debug!("Prometheus metrics initialized");
}

/// 导出指标为 Prometheus 文本格式
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// 角色变更计时，结束时记录次数与耗时
pub struct RoleChangeTimer {
    start: std::time::Instant,
    kind: &'static str,
}

impl RoleChangeTimer {
    pub fn start(kind: &'static str) -> Self {
        Self {
            start: std::time::Instant::now(),
            kind,
        }
    }

    pub fn finish(self, ok: bool) {
        let result = if ok { "ok" } else { "aborted" };
        ROLE_CHANGE_TOTAL.with_label_values(&[self.kind, result]).inc();
        ROLE_CHANGE_DURATION
            .with_label_values(&[self.kind])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        init_metrics();
        RoleChangeTimer::start("switchover").finish(true);
        HEALTH_CHECK_TOTAL.inc();

        let text = gather();
        assert!(text.contains("rpl_role_change_total"));
        assert!(text.contains("rpl_health_check_total"));
    }
}
