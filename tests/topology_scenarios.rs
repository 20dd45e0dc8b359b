// 复制拓扑端到端场景
//
// 通过 lab 拓扑文件构建集群，走公开 API：配置 → 注册表 → 管理命令 / 守护进程 / 一致性检查
//
// 运行：cargo test --test topology_scenarios -- --nocapture

use rpladmin::admin::{Admin, Command};
use rpladmin::failover::{FailoverDaemon, FailoverOptions};
use rpladmin::lab::LabCluster;
use rpladmin::sync::{ConsistencyChecker, SyncFinding, SyncOptions};
use rpladmin::topology::ServerState;
use rpladmin::{ConnectionSpec, EligibilityChecker, GtidSet, RplConfig, ServerIdentity, TopologyRegistry};
use std::io::Write;
use tokio_test::{assert_err, assert_ok};
use std::sync::Arc;
use std::time::Duration;

const TOPOLOGY: &str = r#"
rpl_user = "rpl:rpl"

[[servers]]
host = "db1"
transactions = 4

[[servers]]
host = "db2"
master = "db1:3306"

[[servers]]
host = "db3"
master = "db1:3306"

[[tables]]
database = "shop"
name = "orders"
rows = 3

[[tables]]
database = "shop"
name = "customers"
rows = 2
"#;

fn load_lab(text: &str) -> LabCluster {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    LabCluster::from_file(file.path()).unwrap()
}

fn id(host: &str) -> ServerIdentity {
    ServerIdentity::new(host, 3306)
}

fn config() -> RplConfig {
    RplConfig {
        primary: Some("root:root@db1".to_string()),
        discover: Some("root:root".to_string()),
        rpl_user: Some("rpl:rpl".to_string()),
        timeout: 1,
        ping: 1,
        ..RplConfig::default()
    }
}

fn options(config: &RplConfig) -> FailoverOptions {
    FailoverOptions {
        timeout: Duration::from_millis(500),
        ping: Duration::from_millis(200),
        ..FailoverOptions::from_config(config).unwrap()
    }
    .with_poll_interval(Duration::from_millis(10))
}

async fn registry(cluster: &LabCluster, config: &RplConfig) -> TopologyRegistry {
    TopologyRegistry::from_config(Arc::new(cluster.connector()), config)
        .await
        .unwrap()
}

fn upstream_of(cluster: &LabCluster, host: &str) -> Option<ServerIdentity> {
    cluster
        .server(&id(host))
        .and_then(|s| s.upstream.map(|u| u.identity))
}

// ============================================================================
// 发现 + 健康
// ============================================================================

#[tokio::test]
async fn test_discovery_and_health_from_lab_file() {
    let cluster = load_lab(TOPOLOGY);
    let config = config();
    let mut registry = registry(&cluster, &config).await;
    assert_eq!(registry.replicas().len(), 2);

    let mut admin = Admin::new(&config, options(&config)).unwrap();
    let outcome = admin.execute(&mut registry, &Command::Health).await.unwrap();
    assert!(outcome.output.starts_with("# Replication Topology Health:"));
    for host in ["db1", "db2", "db3"] {
        assert!(outcome.output.contains(host), "{}", outcome.output);
    }

    // 所有从库执行集相同，没有游离事务
    assert!(registry.find_errant_transactions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_health_lists_unreachable_replica_as_down() {
    let cluster = load_lab(TOPOLOGY);
    cluster.set_alive(&id("db3"), false);

    let config = RplConfig {
        discover: None,
        replicas: vec!["root:root@db2".to_string(), "root:root@db3".to_string()],
        ..config()
    };
    assert!(!config.force);
    let mut registry = registry(&cluster, &config).await;
    assert_eq!(registry.replicas().len(), 2);

    let mut admin = Admin::new(&config, options(&config)).unwrap();
    let outcome = admin.execute(&mut registry, &Command::Health).await.unwrap();
    let report = outcome.health.unwrap();
    assert_eq!(report.row(&id("db3")).unwrap().state, ServerState::Down);
    assert_eq!(report.row(&id("db2")).unwrap().state, ServerState::Up);
}

// ============================================================================
// switchover 后新主库不再有上游
// ============================================================================

#[tokio::test]
async fn test_switchover_then_reset_is_idempotent() {
    let cluster = load_lab(TOPOLOGY);
    let config = RplConfig {
        demote: true,
        ..config()
    };
    let mut registry = registry(&cluster, &config).await;
    let mut admin = Admin::new(&config, options(&config)).unwrap();

    let command = Command::Switchover {
        new_primary: "root:root@db2".parse::<ConnectionSpec>().unwrap(),
    };
    let outcome = admin.execute(&mut registry, &command).await.unwrap();
    let change = outcome.role_change.unwrap();
    assert_eq!(change.new_primary, id("db2"));
    assert!(outcome.output.contains("# Replication Topology Health:"));

    assert!(upstream_of(&cluster, "db2").is_none());
    assert_eq!(upstream_of(&cluster, "db1"), Some(id("db2")));
    assert_eq!(upstream_of(&cluster, "db3"), Some(id("db2")));

    let primary = registry.primary().unwrap().view.as_replica();
    assert_ok!(primary.reset_all().await);
    assert_ok!(primary.reset_all().await);
    assert!(upstream_of(&cluster, "db2").is_none());
}

// ============================================================================
// 守护进程：主库失效后选出追平的从库
// ============================================================================

#[tokio::test]
async fn test_daemon_fails_over_to_caught_up_replica() {
    let cluster = load_lab(TOPOLOGY);
    cluster.update(&id("db3"), |s| s.io_paused = true);
    cluster.commit(&id("db1"), 5).unwrap();
    cluster.pump();

    let config = config();
    let mut registry = registry(&cluster, &config).await;
    let mut daemon = FailoverDaemon::new(&config, options(&config))
        .unwrap()
        .with_timing(Duration::from_millis(50), Duration::from_millis(10));

    // 主库在线时不切换
    assert!(assert_ok!(daemon.tick(&mut registry).await).is_none());

    cluster.set_alive(&id("db1"), false);
    let outcome = daemon.tick(&mut registry).await.unwrap().unwrap();
    assert_eq!(outcome.new_primary, id("db2"));
    assert_eq!(outcome.old_primary, Some(id("db1")));

    assert!(upstream_of(&cluster, "db2").is_none());
    assert_eq!(upstream_of(&cluster, "db3"), Some(id("db2")));
    assert_eq!(registry.primary().unwrap().identity, id("db2"));
}

#[test]
fn test_config_rejects_bad_topology() {
    assert_ok!(config().validate());
    // 连接串缺少登录
    assert_err!(RplConfig {
        primary: Some("db1".into()),
        ..config()
    }
    .validate());
    // 主库同时列为从库
    assert_err!(RplConfig {
        replicas: vec!["root:root@db1:3306".into()],
        ..config()
    }
    .validate());
}

// ============================================================================
// 资格检查：force 只会放宽结果
// ============================================================================

#[tokio::test]
async fn test_force_never_makes_candidate_ineligible() {
    let cluster = load_lab(TOPOLOGY);
    cluster.update(&id("db3"), |s| s.binlog_do_db = vec!["shop".to_string()]);
    let registry = registry(&cluster, &config()).await;
    let primary = registry.primary().map(|p| p.view.clone());

    let strict = EligibilityChecker::new(false, None);
    let forced = EligibilityChecker::new(true, None);
    for host in ["db2", "db3"] {
        let view = registry.replica(&id(host)).unwrap().view().unwrap();
        let a = strict.check_candidate(primary.as_ref(), &view, true).await.unwrap();
        let b = forced.check_candidate(primary.as_ref(), &view, true).await.unwrap();
        assert!(!a.eligible || b.eligible, "{}: forced check rejected an eligible candidate", host);
    }
}

// ============================================================================
// 一致性检查
// ============================================================================

#[tokio::test]
async fn test_sync_reports_missing_table_once() {
    let cluster = load_lab(TOPOLOGY);
    cluster.drop_table_on(&id("db2"), "shop", "customers");

    let config = config();
    let registry = registry(&cluster, &config).await;
    let options = SyncOptions {
        rpl_timeout: Duration::from_secs(2),
        sync_interval: Duration::from_millis(10),
        ..SyncOptions::from_config(&config).unwrap()
    };
    let mut checker = ConsistencyChecker::new(&registry, options).await.unwrap();
    let report = checker.run().await.unwrap();

    let db2 = id("db2");
    let missing: Vec<_> = report
        .findings_for(&db2)
        .filter(|f| matches!(f, SyncFinding::TableMissing { table, .. } if table == "customers"))
        .collect();
    assert_eq!(missing.len(), 1);
    assert!(!report.findings_for(&db2).any(|f| f.is_checksum()
        && f.to_string().contains("`customers`")));
    assert!(report
        .findings_for(&id("db3"))
        .any(|f| matches!(f, SyncFinding::ChecksumMatches { table, .. } if table == "orders")));
    assert_eq!(report.issue_count(), 1);
    assert!(report.render().contains("SUMMARY: 1 data consistency issue found."));
}

// ============================================================================
// GTID 集合代数
// ============================================================================

#[test]
fn test_gtid_subtract_properties() {
    let x = GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7-9,8a94f357-aab4-11df-86ab-c80aa9429562:1-3")
        .unwrap();
    let y = GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:4-12,2174b383-5441-11e8-b90a-c80aa9429562:1")
        .unwrap();
    assert!(x.subtract(&x).is_empty());
    assert!(x.subtract(&x.union(&y)).is_empty());
    assert!(y.subtract(&y.union(&x)).is_empty());
    assert!(!x.subtract(&y).is_empty());
}
