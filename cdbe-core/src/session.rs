//! セッションの状態
//!
//! エンジン全体の状態遷移と、`session_accessible` などの通知で
//! 変化するフラグをまとめます。

use crate::protocol::DebuggerCommand;
use cdbe_mi::MiValue;

/// エンジンの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    NotReady,
    SetupRequested,
    SetupFailed,
    /// 起動直後の `g` を送った
    RunRequested,
    InferiorRunRequested,
    InferiorRunOk,
    InferiorStopRequested,
    InferiorStopOk,
    InferiorStopFailed,
    /// ダンプファイルなど実行できない対象
    InferiorUnrunnable,
    InferiorShutdownRequested,
    InferiorShutdownFinished,
    EngineShutdownRequested,
    EngineShutdownFinished,
    Finished,
}

/// 外部から見た大まかな状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SettingUp,
    Running,
    Stopped,
    ShuttingDown,
    Terminated,
    Error,
}

impl EngineState {
    pub fn phase(self) -> Phase {
        match self {
            EngineState::NotReady | EngineState::SetupRequested | EngineState::RunRequested => Phase::SettingUp,
            EngineState::SetupFailed => Phase::Error,
            EngineState::InferiorRunRequested
            | EngineState::InferiorRunOk
            | EngineState::InferiorStopRequested
            | EngineState::InferiorStopFailed => Phase::Running,
            EngineState::InferiorStopOk | EngineState::InferiorUnrunnable => Phase::Stopped,
            EngineState::InferiorShutdownRequested
            | EngineState::InferiorShutdownFinished
            | EngineState::EngineShutdownRequested => Phase::ShuttingDown,
            EngineState::EngineShutdownFinished | EngineState::Finished => Phase::Terminated,
        }
    }

    /// 終了処理中か
    pub fn is_dying(self) -> bool {
        matches!(self.phase(), Phase::ShuttingDown | Phase::Terminated)
    }
}

/// 停止要求の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    NoStopRequested,
    /// ユーザーによる中断
    Interrupt,
    /// コマンドを送るための一時停止（送った後に再開する）
    Callback,
}

/// WOW64 の判定状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wow64State {
    Uninitialized,
    /// WOW64 なし
    NoWow64,
    /// 64 ビットのスタックを見ている
    Native64Stack,
    /// 32 ビットのスタックを見ている
    Emulated32Stack,
}

/// `session_inaccessible` で通知される CDB の実行状態
pub const CDB_STATUS_NO_DEBUGGEE: u64 = 7;

/// CDB の実行状態の名前
pub fn cdb_status_name(status: u64) -> &'static str {
    match status {
        0 => "No change",
        1 => "go",
        2 => "go_handled",
        3 => "go_not_handled",
        4 => "step_over",
        5 => "step_into",
        6 => "break",
        7 => "no_debuggee",
        8 => "step_branch",
        9 => "ignore_event",
        10 => "restart_requested",
        11 => "reverse_go",
        12 => "reverse_step_branch",
        13 => "reverse_step_over",
        14 => "reverse_step_into",
        _ => "unknown",
    }
}

/// セッションごとのフラグ
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// CDB がコマンドを受け付ける状態か
    pub accessible: bool,
    pub has_debuggee: bool,
    pub initial_idle_handled: bool,
    /// 終了処理中は CDB の出力を捨てる
    pub ignore_output: bool,
    pub stop_mode: StopMode,
    pub wow64: Wow64State,
    /// ソース単位のステップインを実行中
    pub source_step_into: bool,
    /// 最後に送った `l-t`/`l+t` の状態
    pub last_operate_by_instruction: bool,
    /// CDB 自身がブレークポイントの行を補正する
    pub auto_breakpoint_correction: bool,
    pub inferior_pid: Option<u32>,
    /// ダンプファイルの停止理由（実行開始後に処理する）
    pub core_stop_reason: Option<MiValue>,
    /// 割り込み後に送るコマンド
    pub deferred: Vec<DebuggerCommand>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            accessible: false,
            has_debuggee: false,
            initial_idle_handled: false,
            ignore_output: false,
            stop_mode: StopMode::NoStopRequested,
            wow64: Wow64State::Uninitialized,
            source_step_into: false,
            last_operate_by_instruction: true,
            auto_breakpoint_correction: false,
            inferior_pid: None,
            core_stop_reason: None,
            deferred: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases() {
        assert_eq!(EngineState::SetupRequested.phase(), Phase::SettingUp);
        assert_eq!(EngineState::InferiorRunOk.phase(), Phase::Running);
        assert_eq!(EngineState::InferiorStopOk.phase(), Phase::Stopped);
        assert_eq!(EngineState::EngineShutdownRequested.phase(), Phase::ShuttingDown);
        assert_eq!(EngineState::SetupFailed.phase(), Phase::Error);
        assert!(EngineState::Finished.is_dying());
        assert!(!EngineState::InferiorStopOk.is_dying());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(cdb_status_name(CDB_STATUS_NO_DEBUGGEE), "no_debuggee");
        assert_eq!(cdb_status_name(6), "break");
        assert_eq!(cdb_status_name(99), "unknown");
    }

    #[test]
    fn test_context_defaults() {
        let ctx = SessionContext::default();
        assert!(!ctx.accessible);
        assert!(ctx.last_operate_by_instruction);
        assert_eq!(ctx.wow64, Wow64State::Uninitialized);
        assert_eq!(ctx.stop_mode, StopMode::NoStopRequested);
    }
}
