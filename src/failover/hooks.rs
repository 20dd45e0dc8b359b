//! 外部脚本钩子
//!
//! 参数依次为 `old_host old_port new_host new_port` (post_fail 只有旧主库两项)。
//! 非零退出码只记录警告；设置阈值且退出码不小于阈值时中止。

use crate::server::ServerIdentity;
use crate::{Result, RplError};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// 单个外部脚本
#[derive(Debug, Clone)]
pub struct ScriptHook {
    path: PathBuf,
    threshold: Option<i32>,
}

impl ScriptHook {
    pub fn new(path: impl Into<PathBuf>, threshold: Option<i32>) -> Self {
        Self {
            path: path.into(),
            threshold,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 脚本存在且可执行
    pub fn check(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.path).map_err(|_| {
            RplError::ScriptError(format!("External script '{}' not found.", self.path.display()))
        })?;
        if !metadata.is_file() || !is_executable(&metadata) {
            return Err(RplError::ScriptError(format!(
                "External script '{}' is not executable.",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// 执行并返回退出码
    pub async fn run(&self, args: &[String]) -> Result<i32> {
        log::info!("Spawning external script {}", self.path.display());
        let output = Command::new(&self.path)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                RplError::ScriptError(format!("Cannot execute '{}': {}", self.path.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            log::debug!("[{}] {}", self.path.display(), stdout.trim());
        }

        // 被信号终止时没有退出码
        let code = output.status.code().unwrap_or(-1);
        if let Some(threshold) = self.threshold {
            if code >= threshold {
                return Err(RplError::ScriptError(format!(
                    "External script '{}' failed. Result = {}. Specified threshold exceeded. Operation aborted. \
                     The operation did not complete; check the topology for inconsistencies.",
                    self.path.display(),
                    code
                )));
            }
        }
        if code == 0 {
            log::info!("Script completed Ok.");
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::warn!(
                "{} Script failed. Result = {}. {}",
                self.path.display(),
                code,
                stderr.trim()
            );
        }
        Ok(code)
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// 角色变更前后的钩子集合
#[derive(Debug, Clone, Default)]
pub struct RoleChangeHooks {
    pub before: Option<ScriptHook>,
    pub after: Option<ScriptHook>,
}

impl RoleChangeHooks {
    pub fn new(before: Option<PathBuf>, after: Option<PathBuf>, threshold: Option<i32>) -> Self {
        Self {
            before: before.map(|p| ScriptHook::new(p, threshold)),
            after: after.map(|p| ScriptHook::new(p, threshold)),
        }
    }

    /// 变更前校验所有脚本
    pub fn check(&self) -> Result<()> {
        for hook in self.before.iter().chain(self.after.iter()) {
            hook.check()?;
        }
        Ok(())
    }

    pub async fn run_before(&self, old: Option<&ServerIdentity>, new: &ServerIdentity) -> Result<()> {
        if let Some(hook) = &self.before {
            hook.run(&role_change_args(old, Some(new))).await?;
        }
        Ok(())
    }

    pub async fn run_after(&self, old: Option<&ServerIdentity>, new: &ServerIdentity) -> Result<()> {
        if let Some(hook) = &self.after {
            hook.run(&role_change_args(old, Some(new))).await?;
        }
        Ok(())
    }
}

/// 旧主库未知时使用 UNKNOWN
pub fn role_change_args(old: Option<&ServerIdentity>, new: Option<&ServerIdentity>) -> Vec<String> {
    let mut args = match old {
        Some(id) => vec![id.host.clone(), id.port.to_string()],
        None => vec!["UNKNOWN".to_string(), "UNKNOWN".to_string()],
    };
    if let Some(id) = new {
        args.push(id.host.clone());
        args.push(id.port.to_string());
    }
    args
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_script_receives_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let path = script(&dir, "after.sh", &format!("echo \"$@\" > {}", out.display()));

        let hook = ScriptHook::new(path, None);
        hook.check().unwrap();
        let args = role_change_args(
            Some(&ServerIdentity::new("p", 3306)),
            Some(&ServerIdentity::new("r1", 3307)),
        );
        assert_eq!(hook.run(&args).await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "p 3306 r1 3307");
    }

    #[tokio::test]
    async fn test_threshold_escalates_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "fail.sh", "exit 3");

        assert_eq!(ScriptHook::new(path.clone(), None).run(&[]).await.unwrap(), 3);
        assert_eq!(ScriptHook::new(path.clone(), Some(5)).run(&[]).await.unwrap(), 3);
        let err = ScriptHook::new(path, Some(2)).run(&[]).await.unwrap_err();
        assert!(matches!(err, RplError::ScriptError(_)));
    }

    #[test]
    fn test_missing_or_plain_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ScriptHook::new(dir.path().join("nope.sh"), None).check().is_err());

        let plain = dir.path().join("plain.sh");
        std::fs::write(&plain, "echo hi").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();
        let hooks = RoleChangeHooks::new(Some(plain), None, None);
        assert!(matches!(hooks.check(), Err(RplError::ScriptError(_))));
    }
}
