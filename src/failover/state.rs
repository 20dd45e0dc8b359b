//! 角色变更状态机
//!
//! ```text
//! Idle → CandidateSelected → CandidatePrepared → PrimaryFenced
//!      → RolesSwapped → ReplicasRepointed → Complete
//! ```
//!
//! 任意非终止状态都可进入 `Aborted`。故障转移没有写屏蔽，
//! 可从 `CandidatePrepared` 直接进入 `RolesSwapped`。

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// 角色变更阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Idle,
    CandidateSelected,
    CandidatePrepared,
    PrimaryFenced,
    RolesSwapped,
    ReplicasRepointed,
    Complete,
    Aborted,
}

impl FailoverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailoverState::Complete | FailoverState::Aborted)
    }

    /// 是否已进入变更窗口 (此后的失败不回滚)
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            FailoverState::PrimaryFenced | FailoverState::RolesSwapped | FailoverState::ReplicasRepointed
        )
    }

    /// 合法的下一状态
    pub fn can_transition_to(&self, next: FailoverState) -> bool {
        use FailoverState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Aborted {
            return true;
        }
        matches!(
            (self, next),
            (Idle, CandidateSelected)
                | (CandidateSelected, CandidatePrepared)
                | (CandidatePrepared, PrimaryFenced)
                | (CandidatePrepared, RolesSwapped)
                | (PrimaryFenced, RolesSwapped)
                | (RolesSwapped, ReplicasRepointed)
                | (ReplicasRepointed, Complete)
        )
    }
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 状态跟踪，记录每次转换
#[derive(Clone)]
pub struct StateTracker {
    kind: &'static str,
    state: Arc<RwLock<FailoverState>>,
    history: Arc<RwLock<Vec<FailoverState>>>,
}

impl StateTracker {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Arc::new(RwLock::new(FailoverState::Idle)),
            history: Arc::new(RwLock::new(vec![FailoverState::Idle])),
        }
    }

    pub fn current(&self) -> FailoverState {
        *self.state.read()
    }

    pub fn history(&self) -> Vec<FailoverState> {
        self.history.read().clone()
    }

    /// 推进状态，非法转换返回 false 且保持不变
    pub fn advance(&self, next: FailoverState) -> bool {
        let mut state = self.state.write();
        let old = *state;
        if !old.can_transition_to(next) {
            log::error!("[{}] Illegal state transition: {} -> {}", self.kind, old, next);
            return false;
        }
        *state = next;
        self.history.write().push(next);

        log::info!("[{}] State changed: {} -> {}", self.kind, old, next);
        true
    }

    /// 进入 Aborted (已终止时不变)
    pub fn abort(&self, reason: &str) {
        let old = self.current();
        if self.advance(FailoverState::Aborted) {
            if old.is_mutating() {
                log::error!(
                    "[{}] Aborted during {}: {}. The topology may be partially migrated; re-run the health check.",
                    self.kind,
                    old,
                    reason
                );
            } else {
                log::error!("[{}] Aborted before any change: {}", self.kind, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switchover_path() {
        let tracker = StateTracker::new("switchover");
        for next in [
            FailoverState::CandidateSelected,
            FailoverState::CandidatePrepared,
            FailoverState::PrimaryFenced,
            FailoverState::RolesSwapped,
            FailoverState::ReplicasRepointed,
            FailoverState::Complete,
        ] {
            assert!(tracker.advance(next));
        }
        assert_eq!(tracker.history().len(), 7);
        assert!(!tracker.advance(FailoverState::Aborted));
    }

    #[test]
    fn test_failover_skips_fence() {
        let tracker = StateTracker::new("failover");
        assert!(tracker.advance(FailoverState::CandidateSelected));
        assert!(tracker.advance(FailoverState::CandidatePrepared));
        assert!(tracker.advance(FailoverState::RolesSwapped));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let tracker = StateTracker::new("switchover");
        assert!(!tracker.advance(FailoverState::RolesSwapped));
        assert_eq!(tracker.current(), FailoverState::Idle);

        tracker.abort("candidate not eligible");
        assert_eq!(tracker.current(), FailoverState::Aborted);
        assert!(!tracker.advance(FailoverState::CandidateSelected));
    }
}
