//! 管理账号权限检查
//!
//! 只返回缺失项，严重程度由调用方决定。

use super::TopologyRegistry;
use crate::server::{ConnectionSpec, ServerHandle, ServerIdentity};
use crate::Result;
use std::collections::BTreeSet;

/// elect / failover / switchover 需要的权限
pub const ADMIN_PRIVILEGES: [&str; 8] = [
    "SUPER",
    "GRANT OPTION",
    "REPLICATION SLAVE",
    "SELECT",
    "RELOAD",
    "DROP",
    "CREATE",
    "INSERT",
];

/// 其余命令只需要 SUPER
pub const BASIC_PRIVILEGES: [&str; 1] = ["SUPER"];

/// 某服务器上登录账号缺少的权限
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeFinding {
    pub user: String,
    pub identity: ServerIdentity,
    pub missing: Vec<String>,
}

impl PrivilegeFinding {
    pub fn describe(&self) -> String {
        format!(
            "User {} on {} does not have sufficient privileges to execute this command (missing {}).",
            self.user,
            self.identity,
            self.missing.join(", ")
        )
    }
}

/// 检查单台服务器当前账号
pub async fn missing_privileges(handle: &ServerHandle, required: &[&str]) -> Result<Option<PrivilegeFinding>> {
    let account = handle.current_user().await?;
    let held: BTreeSet<String> = handle
        .user_privileges(&account)
        .await?
        .into_iter()
        .map(|p| p.to_ascii_uppercase())
        .collect();

    if held.contains("ALL PRIVILEGES") && held.contains("GRANT OPTION") {
        return Ok(None);
    }
    let missing: Vec<String> = required
        .iter()
        .filter(|p| !held.contains(**p) && !(held.contains("ALL PRIVILEGES") && **p != "GRANT OPTION"))
        .map(|p| p.to_string())
        .collect();
    if missing.is_empty() {
        return Ok(None);
    }
    Ok(Some(PrivilegeFinding {
        user: account.user,
        identity: handle.identity(),
        missing,
    }))
}

impl TopologyRegistry {
    /// 检查主库、从库与候选上的管理权限
    pub async fn check_privileges(
        &self,
        admin_grade: bool,
        skip_primary: bool,
        candidates: &[ConnectionSpec],
    ) -> Result<Vec<PrivilegeFinding>> {
        let required: &[&str] = if admin_grade {
            &ADMIN_PRIVILEGES
        } else {
            &BASIC_PRIVILEGES
        };

        let mut servers: Vec<ServerHandle> = Vec::new();
        if !skip_primary {
            if let Some(primary) = self.primary() {
                servers.push(primary.view.handle().clone());
            }
        }
        servers.extend(self.replicas().iter().filter_map(|r| r.handle.clone()));

        if !candidates.is_empty() {
            log::info!("Checking privileges on candidates");
        }
        for spec in candidates {
            match self.connect_candidate(spec).await {
                Ok(handle) => {
                    if !servers.iter().any(|s| s.identity().same_server(&handle.identity())) {
                        servers.push(handle);
                    }
                }
                Err(e) => log::warn!("[{}] Cannot connect to candidate: {}", spec.identity(), e),
            }
        }

        let mut findings = Vec::new();
        for handle in &servers {
            if !handle.is_alive().await {
                continue;
            }
            if let Some(finding) = missing_privileges(handle, required).await? {
                log::error!("{}", finding.describe());
                findings.push(finding);
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::LabUser;
    use crate::server::connection::MockServerConnection;
    use crate::server::{Credentials, UserAccount};
    use crate::topology::test_support::*;
    use crate::topology::TopologyRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_root_has_admin_privileges() {
        let cluster = star("p", &["r1"], 0);
        let registry = registry(&cluster, Some("p"), &["r1"]).await;
        assert!(registry.check_privileges(true, false, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limited_user_reported() {
        let cluster = star("p", &["r1"], 0);
        for host in ["p", "r1"] {
            cluster.update(&ServerIdentity::new(host, 3306), |s| {
                s.users.push(LabUser::new("ops", "ops", &["SUPER", "SELECT"]))
            });
        }
        let ops = Credentials::new("ops", Some("ops".into()));
        let registry = TopologyRegistry::connect(
            Arc::new(cluster.connector()),
            Some(&ConnectionSpec::new(ops.clone(), "p", 3306)),
            &[ConnectionSpec::new(ops, "r1", 3306)],
            true,
        )
        .await
        .unwrap();

        assert!(registry.check_privileges(false, false, &[]).await.unwrap().is_empty());

        let findings = registry.check_privileges(true, true, &[]).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].identity.host, "r1");
        assert!(findings[0].missing.contains(&"RELOAD".to_string()));
        assert!(!findings[0].missing.contains(&"SUPER".to_string()));
    }

    #[tokio::test]
    async fn test_all_privileges_grant() {
        let mut mock = MockServerConnection::new();
        mock.expect_identity()
            .returning(|| ServerIdentity::new("db1", 3306));
        mock.expect_current_user()
            .returning(|| Ok(UserAccount::new("admin", "%")));
        mock.expect_user_privileges()
            .returning(|_| Ok(vec!["ALL PRIVILEGES".to_string()]));
        let handle: ServerHandle = Arc::new(mock);

        let finding = missing_privileges(&handle, &ADMIN_PRIVILEGES).await.unwrap().unwrap();
        assert_eq!(finding.missing, vec!["GRANT OPTION".to_string()]);
    }
}
