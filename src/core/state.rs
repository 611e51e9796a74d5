use crate::domain::model::BuildState;
use crate::utils::error::{BootstrapError, Result};

/// Tracks a single build through its states. Only forward moves along the
/// happy path, or a move to `BUILD_FAILED` from a non-terminal state, are legal.
#[derive(Debug, Clone)]
pub struct BuildLifecycle {
    state: BuildState,
    history: Vec<BuildState>,
}

impl Default for BuildLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildLifecycle {
    pub fn new() -> Self {
        Self {
            state: BuildState::Pending,
            history: vec![BuildState::Pending],
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn history(&self) -> &[BuildState] {
        &self.history
    }

    pub fn advance(&mut self, to: BuildState) -> Result<BuildState> {
        if self.state.next() != Some(to) {
            return Err(BootstrapError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        Ok(self.set(to))
    }

    pub fn fail(&mut self) -> Result<BuildState> {
        if self.state.is_terminal() {
            return Err(BootstrapError::InvalidTransition {
                from: self.state.to_string(),
                to: BuildState::BuildFailed.to_string(),
            });
        }
        Ok(self.set(BuildState::BuildFailed))
    }

    fn set(&mut self, to: BuildState) -> BuildState {
        let from = self.state;
        self.state = to;
        self.history.push(to);
        from
    }
}
