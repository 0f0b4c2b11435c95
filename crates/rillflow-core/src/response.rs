use serde::{Deserialize, Serialize};

use crate::ValueRef;

/// Reserved field of an executor result. When a result object carries it,
/// the engine replaces the workflow's persisted state with its value and
/// strips the field from the recorded result.
pub const STATE_FIELD: &str = "@state";

/// The normalized outcome of one stage invocation.
///
/// Snapshots are immutable once created; the execution context stores one
/// per stage under its numeric index and, when the spec declares an `id`,
/// a second identical copy under that alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResponse {
    /// The executor's output, when it ran and succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ValueRef>,
    /// Whether the executor invocation succeeded (true for `if: false` skips).
    pub ok: bool,
    /// The executor's error message, when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured stdout of the stage's `cmd`, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_result: Option<String>,
    /// Exit code of the stage's `cmd`, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_code: Option<i32>,
    /// Whether the stage's `cmd` exited zero (true when no `cmd` ran).
    pub cmd_ok: bool,
    /// Effective stage success: `ok && cmd_ok`.
    pub is_real_ok: bool,
}

impl StageResponse {
    /// A successful no-op, used when a stage's `if` resolves false.
    pub fn skipped() -> Self {
        Self {
            result: None,
            ok: true,
            error: None,
            cmd_result: None,
            cmd_code: None,
            cmd_ok: true,
            is_real_ok: true,
        }
    }

    pub fn success(result: ValueRef) -> Self {
        Self {
            result: Some(result),
            ok: true,
            error: None,
            cmd_result: None,
            cmd_code: None,
            cmd_ok: true,
            is_real_ok: true,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: None,
            ok: false,
            error: Some(error.into()),
            cmd_result: None,
            cmd_code: None,
            cmd_ok: true,
            is_real_ok: false,
        }
    }

    /// Fold a shell command's outcome into the response. Effective success
    /// becomes the logical AND of the executor and command outcomes.
    pub fn with_cmd(mut self, stdout: String, code: Option<i32>) -> Self {
        self.cmd_ok = code == Some(0);
        self.cmd_code = code;
        self.cmd_result = Some(stdout);
        self.is_real_ok = self.ok && self.cmd_ok;
        self
    }
}
