use serde::{Deserialize, Serialize};

/// Persisted search progress for one assistant message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub total: u32,
    pub completed: u32,
    pub is_deep_search: bool,
    pub is_complete: bool,
}

impl ProgressState {
    pub fn deep_search(total: u32) -> Self {
        Self {
            total,
            completed: 0,
            is_deep_search: true,
            is_complete: false,
        }
    }

    /// State recorded when no search was needed.
    pub fn direct_answer() -> Self {
        Self {
            total: 1,
            completed: 1,
            is_deep_search: false,
            is_complete: true,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.is_complete {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        let ratio = f64::from(self.completed.min(self.total)) / f64::from(self.total);
        (ratio * 100.0).round() as u8
    }

    pub fn is_consistent(&self) -> bool {
        if self.completed > self.total {
            return false;
        }
        !self.is_complete || self.completed == self.total || !self.is_deep_search
    }
}
