//! 応答を受け取ったときの処理
//!
//! クロージャの代わりに、必要なデータだけを持つ列挙型で表します。
//! エンジンを作り直しても古い応答が新しいセッションに触れることはありません。

use crate::breakpoint::ModelId;
use cdbe_mi::MiValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Callback {
    /// `bu`/`bp` の応答（曖昧なシンボルの展開）
    BreakInsert { model_id: Option<ModelId> },
    /// 起動時の PID 取得
    Pid,
    /// `print(sys.version)`
    ScriptVersion,
    /// スクリプトの出力をログへ流すだけ
    ScriptMessages,
    Threads,
    Stack,
    /// `lm m wow64`
    CheckWow64 { stack: MiValue },
    /// `k` のヘッダで 32/64 ビットのスタックを判定
    Wow64StackHeader { stack: MiValue },
    /// `!wow64exts.sw`
    SwitchWow64Stack,
    Breakpoints,
    Modules,
    Registers,
    /// 条件付きブレークポイントの条件評価
    Expression { model_id: ModelId, stop_reason: MiValue },
    /// 任意の式の評価
    Evaluate { expression: String },
    Memory { address: u64, length: u64 },
    /// `x module!function`
    ResolveSymbol {
        symbol: String,
        agent_address: u64,
        function: String,
    },
    Disassemble { address: u64 },
    /// `` ? `file:line` ``
    JumpToLine,
    SelectThread,
    FullBacktrace,
}
