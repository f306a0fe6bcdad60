//! エンジンのエラー型

use crate::breakpoint::ModelId;
use crate::session::EngineState;
use thiserror::Error;

/// 呼び出し側が種類で分岐するエラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// CDB プロセスが動いていない
    #[error("CDB is not running")]
    NotRunning,

    /// 現在の状態では実行できない操作
    #[error("Cannot {operation} in state {state:?}")]
    WrongState {
        operation: &'static str,
        state: EngineState,
    },

    /// 未知のブレークポイント
    #[error("Unknown breakpoint {0}")]
    UnknownBreakpoint(ModelId),

    /// このエンジンでは扱えない種類のブレークポイント
    #[error("Breakpoint type {0} is not supported by CDB")]
    UnsupportedBreakpoint(&'static str),

    /// 割り込みできない（リモートセッション、PID 不明）
    #[error("Interrupting is not possible in remote sessions.")]
    InterruptImpossible,
}
