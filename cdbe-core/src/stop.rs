//! 停止理由の判定
//!
//! `session_idle` で届いた停止理由から、停止を通知するか、黙って再開するか、
//! 条件式を評価してから決めるかを判断します。入力だけで結果が決まる純粋関数です。

use crate::breakpoint::{BreakpointBook, BreakpointType, ModelId};
use crate::session::StopMode;
use cdbe_mi::exception::{EXCEPTION_CTRL_PRESSED, EXCEPTION_SET_THREAD_NAME, EXCEPTION_WX86_BREAKPOINT};
use cdbe_mi::{MiValue, WinException};
use std::ops::{BitOr, BitOrAssign};

/// 停止時の処理フラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StopFlags(u32);

impl StopFlags {
    pub const NONE: StopFlags = StopFlags(0);
    pub const REPORT_LOG: StopFlags = StopFlags(0x1);
    pub const REPORT_STATUS: StopFlags = StopFlags(0x2);
    pub const REPORT_PARSE_ERROR: StopFlags = StopFlags(0x4);
    pub const SHOW_EXCEPTION_BOX: StopFlags = StopFlags(0x8);
    pub const NOTIFY_STOP: StopFlags = StopFlags(0x10);
    pub const IGNORE_CONTINUE: StopFlags = StopFlags(0x20);
    /// `DebugBreak()` などで作られたスレッドで止まった
    pub const ARTIFICIAL_THREAD: StopFlags = StopFlags(0x40);
    pub const SHUTDOWN_IN_PROGRESS: StopFlags = StopFlags(0x80);

    pub fn contains(self, other: StopFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for StopFlags {
    type Output = StopFlags;

    fn bitor(self, rhs: StopFlags) -> StopFlags {
        StopFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for StopFlags {
    fn bitor_assign(&mut self, rhs: StopFlags) {
        self.0 |= rhs.0;
    }
}

/// 判定に必要なエンジンの状態
pub struct StopContext<'a> {
    pub shutting_down: bool,
    /// すでに停止している（関数呼び出しによる重複通知）
    pub already_stopped: bool,
    pub stop_mode: StopMode,
    pub breakpoints: &'a BreakpointBook,
    /// 条件式の評価後の再判定
    pub reentry: bool,
}

/// 判定結果
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopDecision {
    pub flags: StopFlags,
    pub message: String,
    pub exception_box: Option<String>,
    /// ブレークポイントに設定されたメッセージ
    pub breakpoint_message: Option<String>,
}

/// 条件式の評価要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionQuery {
    pub model_id: ModelId,
    /// `expression` コマンドの引数
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopAnalysis {
    Decided(StopDecision),
    /// 条件式の値が出てから判定をやり直す
    EvaluateCondition {
        decision: StopDecision,
        query: ConditionQuery,
    },
}

impl StopAnalysis {
    pub fn decision(&self) -> &StopDecision {
        match self {
            StopAnalysis::Decided(d) | StopAnalysis::EvaluateCondition { decision: d, .. } => d,
        }
    }
}

pub const MSG_INTERRUPTED: &str = "Interrupted.";

fn decided(flags: StopFlags, message: impl Into<String>) -> StopAnalysis {
    StopAnalysis::Decided(StopDecision {
        flags,
        message: message.into(),
        ..Default::default()
    })
}

/// 停止理由を判定する
pub fn examine_stop_reason(stop: &MiValue, ctx: &StopContext<'_>) -> StopAnalysis {
    let mut flags = StopFlags::NONE;
    if ctx.shutting_down {
        flags |= StopFlags::SHUTDOWN_IN_PROGRESS;
    }
    let reason = match stop.non_empty("reason") {
        Some(reason) => reason,
        None => {
            return decided(
                flags | StopFlags::REPORT_PARSE_ERROR | StopFlags::NOTIFY_STOP,
                "Malformed stop response received.",
            )
        }
    };
    if ctx.already_stopped {
        return decided(
            flags | StopFlags::REPORT_LOG,
            format!("Ignored stop notification from function call ({}).", reason),
        );
    }
    let thread_id = stop.get("threadId").and_then(MiValue::to_i64).unwrap_or(0);

    match reason {
        "breakpoint" => examine_breakpoint(stop, ctx, flags, thread_id),
        "exception" => examine_exception(stop, ctx, flags, thread_id),
        _ => decided(
            flags | StopFlags::REPORT_STATUS | StopFlags::NOTIFY_STOP,
            format!("Stopped: \"{}\".", reason),
        ),
    }
}

fn examine_breakpoint(stop: &MiValue, ctx: &StopContext<'_>, mut flags: StopFlags, thread_id: i64) -> StopAnalysis {
    // 行まで実行などの内部ブレークポイントは見つからない
    let response_id = stop.str("breakpointId").unwrap_or("");
    let Some((bp, display_name)) = ctx.breakpoints.resolve(response_id) else {
        return decided(flags | StopFlags::NOTIFY_STOP, "");
    };
    let mut decision = StopDecision {
        breakpoint_message: (!bp.params.message.is_empty()).then(|| bp.params.message.clone()),
        ..Default::default()
    };

    if bp.params.tracepoint {
        decision.flags = StopFlags::REPORT_LOG | StopFlags::IGNORE_CONTINUE;
        decision.message = format!("Trace point {} in thread {} triggered.", display_name, thread_id);
        return StopAnalysis::Decided(decision);
    }

    if !ctx.reentry && !bp.params.condition.is_empty() {
        let condition = &bp.params.condition;
        decision.flags = StopFlags::REPORT_LOG;
        decision.message = format!(
            "Conditional breakpoint {} in thread {} triggered, examining expression \"{}\".",
            display_name, thread_id, condition
        );
        let expression = if condition.contains(' ') && !condition.starts_with('"') {
            format!("\"{}\"", condition)
        } else {
            condition.clone()
        };
        return StopAnalysis::EvaluateCondition {
            decision,
            query: ConditionQuery {
                model_id: bp.model_id,
                expression,
            },
        };
    }

    decision.message = if bp.params.kind == BreakpointType::WatchpointAtAddress {
        format!(
            "Data breakpoint {} at 0x{:x} in thread {} triggered.",
            display_name, bp.params.address, thread_id
        )
    } else {
        format!("Stopped at breakpoint {} in thread {}.", display_name, thread_id)
    };
    flags |= StopFlags::REPORT_STATUS | StopFlags::NOTIFY_STOP;
    decision.flags = flags;
    StopAnalysis::Decided(decision)
}

fn examine_exception(stop: &MiValue, ctx: &StopContext<'_>, mut flags: StopFlags, thread_id: i64) -> StopAnalysis {
    if ctx.stop_mode == StopMode::Callback {
        flags |= StopFlags::IGNORE_CONTINUE;
    }
    let exception = WinException::from_mi(stop);
    // ステップ中に DLL が読み込まれると発生する。メッセージボックスは出さない
    if exception.code == EXCEPTION_SET_THREAD_NAME || exception.code == EXCEPTION_WX86_BREAKPOINT {
        return decided(StopFlags::NOTIFY_STOP, "");
    }
    if exception.code == EXCEPTION_CTRL_PRESSED {
        return decided(
            flags | StopFlags::REPORT_STATUS | StopFlags::NOTIFY_STOP | StopFlags::ARTIFICIAL_THREAD,
            MSG_INTERRUPTED,
        );
    }
    if exception.is_debugger_exception() {
        flags |= StopFlags::REPORT_STATUS | StopFlags::NOTIFY_STOP;
        if exception.function == "ntdll!DbgBreakPoint" {
            flags |= StopFlags::ARTIFICIAL_THREAD;
        }
        return decided(flags, MSG_INTERRUPTED);
    }
    let description = exception.describe(true);
    StopAnalysis::Decided(StopDecision {
        flags: flags | StopFlags::SHOW_EXCEPTION_BOX | StopFlags::REPORT_STATUS | StopFlags::NOTIFY_STOP,
        exception_box: Some(format!("Stopped in thread {} by: {}.", thread_id, description)),
        message: description,
        breakpoint_message: None,
    })
}
