//! 角色变更
//!
//! - `eligibility`: 候选资格检查与选举
//! - `state`: 状态机
//! - `engine`: switchover / failover 流程
//! - `hooks`: 外部脚本
//! - `daemon`: 主库监控与自动故障转移

pub mod daemon;
pub mod eligibility;
pub mod engine;
pub mod hooks;
pub mod state;

pub use daemon::{FailoverDaemon, LivenessProbe};
pub use eligibility::{CheckName, EligibilityChecker, EligibilityResult};
pub use engine::{FailoverEngine, FailoverOptions, RoleChangeOutcome};
pub use hooks::{role_change_args, RoleChangeHooks, ScriptHook};
pub use state::{FailoverState, StateTracker};
