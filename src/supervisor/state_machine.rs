use serde::Serialize;
use thiserror::Error;

/// 워커 프로세스 상태
///
/// `NotStarted → Starting → Ready → Running → {Stopped | Crashed}`.
/// `Crashed` 는 종료 상태다. `Stopped` 에서는 다시 시작할 수 있다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Starting,
    Ready,
    Running,
    Stopped,
    Crashed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(WorkerState, WorkerState),
}

#[derive(Debug)]
pub struct StateMachine {
    state: WorkerState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: WorkerState::NotStarted }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn can_transition(&self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self.state, to),
            (NotStarted, Starting)
                | (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Stopped)
                | (Ready, Running)
                | (Ready, Stopped)
                | (Running, Stopped)
                | (Running, Crashed)
        )
    }

    pub fn transition(&mut self, to: WorkerState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("[Supervisor] State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), WorkerState::NotStarted);
        assert!(sm.transition(WorkerState::Starting).is_ok());
        assert!(sm.transition(WorkerState::Ready).is_ok());
        assert!(sm.transition(WorkerState::Running).is_ok());
        assert!(sm.transition(WorkerState::Stopped).is_ok());
        // 정상 정지 후 재시작
        assert!(sm.transition(WorkerState::Starting).is_ok());
    }

    #[test]
    fn readiness_timeout_ends_stopped() {
        let mut sm = StateMachine::new();
        sm.transition(WorkerState::Starting).unwrap();
        assert!(sm.transition(WorkerState::Stopped).is_ok());
    }

    #[test]
    fn crashed_is_terminal() {
        let mut sm = StateMachine::new();
        for s in [WorkerState::Starting, WorkerState::Ready, WorkerState::Running, WorkerState::Crashed] {
            sm.transition(s).unwrap();
        }
        for s in [WorkerState::Starting, WorkerState::Stopped, WorkerState::Running] {
            assert_eq!(
                sm.transition(s),
                Err(TransitionError::InvalidTransition(WorkerState::Crashed, s))
            );
        }
    }

    #[test]
    fn cannot_skip_readiness() {
        let mut sm = StateMachine::new();
        sm.transition(WorkerState::Starting).unwrap();
        assert!(sm.transition(WorkerState::Running).is_err());
        assert!(sm.transition(WorkerState::Crashed).is_err());
    }
}
