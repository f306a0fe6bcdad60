//! エンジンの出力先
//!
//! エンジンは解析したデータをこのトレイト経由で外部（CLI や UI）へ渡します。
//! ログ以外のメソッドはすべて既定で何もしません。

use crate::breakpoint::Breakpoint;
use crate::disasm::DisassemblerLine;
use crate::session::EngineState;
use cdbe_mi::{Frame, MiValue, Module, Register, ThreadList};

/// メッセージの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogChannel {
    /// CDB へ送ったコマンド
    Input,
    Misc,
    Warning,
    Error,
    /// デバッグ対象の出力
    AppOutput,
    /// ステータスバー向けの短いメッセージ
    Status,
}

pub trait EngineSink {
    fn show_message(&mut self, text: &str, channel: LogChannel);

    fn state_changed(&mut self, _state: EngineState) {}

    fn set_threads(&mut self, _threads: &ThreadList) {}

    /// `current` は表示すべきフレーム
    fn set_frames(&mut self, _frames: &[Frame], _incomplete: bool, _current: Option<usize>) {}

    fn breakpoint_changed(&mut self, _breakpoint: &Breakpoint) {}

    fn set_registers(&mut self, _registers: &[Register]) {}

    fn set_modules(&mut self, _modules: &[Module]) {}

    fn memory_fetched(&mut self, _address: u64, _data: &[u8]) {}

    fn disassembly(&mut self, _lines: &[DisassemblerLine]) {}

    fn full_backtrace(&mut self, _text: &str) {}

    /// 式評価の結果
    fn expression_result(&mut self, _expression: &str, _value: &MiValue) {}

    /// 例外で停止したことを知らせるメッセージボックス
    fn exception_box(&mut self, _message: &str) {}

    /// 起動失敗
    fn setup_failed(&mut self, _message: &str) {}
}
