//! 対話コマンド

use crate::breakpoint::{BreakpointParameters, ModelId};
use crate::parse::{parse_address, split_file_line};

/// 位置の指定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// `main.cpp:18`
    FileAndLine(String, u32),
    /// `*0x401000` または `0x401000`
    Address(u64),
    /// `app!main` または `main`
    Function(String),
}

impl Location {
    /// 位置の文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if let Some(address) = input.strip_prefix('*') {
            return parse_address(address).ok().map(Location::Address);
        }
        if input.starts_with("0x") || input.starts_with("0X") {
            return parse_address(input).ok().map(Location::Address);
        }
        if let Some((file, line)) = split_file_line(input) {
            return Some(Location::FileAndLine(file.to_string(), line));
        }
        Some(Location::Function(input.to_string()))
    }

    /// ブレークポイントのパラメータにする
    pub fn to_breakpoint(&self) -> BreakpointParameters {
        match self {
            Location::FileAndLine(file, line) => BreakpointParameters::file_and_line(file.clone(), *line),
            Location::Address(address) => BreakpointParameters::address(*address),
            Location::Function(function) => BreakpointParameters::function(function.clone()),
        }
    }
}

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定（`if` 以降は条件）
    Break(Location, Option<String>),
    /// トレースポイント（止まらずにログだけ出す）
    Trace(Location),
    /// データブレークポイント
    Watch(u64, u32),
    Delete(ModelId),
    Enable(ModelId),
    Disable(ModelId),
    /// ブレークポイント一覧
    Breakpoints,
    /// 実行継続
    Continue,
    /// ステップイン
    Step,
    /// 命令単位のステップイン
    StepInstruction,
    /// ステップオーバー
    Next,
    /// 命令単位のステップオーバー
    NextInstruction,
    /// 現在の関数から抜けるまで実行
    Finish,
    /// 指定位置まで実行
    Until(Location),
    /// 指定位置へ PC を移す
    Jump(Location),
    /// 実行中のデバッグ対象を止める
    Interrupt,
    /// バックトレース表示
    Backtrace,
    /// 全スレッドの詳細なバックトレース
    FullBacktrace,
    Threads,
    Thread(String),
    Registers,
    SetRegister(String, String),
    Modules,
    /// メモリ表示
    Memory(u64, u64),
    /// 式の評価
    Print(String),
    /// 逆アセンブル
    Disassemble(Option<Location>),
    /// CDB にそのまま送る
    Raw(String),
    Detach,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

fn parse_id(s: Option<&&str>) -> Option<ModelId> {
    s?.parse().ok()
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }
        let rest = || parts[1..].join(" ");

        match parts[0] {
            "break" | "b" => {
                let rest = rest();
                let (location, condition) = match rest.split_once(" if ") {
                    Some((location, condition)) => (location.to_string(), Some(condition.trim().to_string())),
                    None => (rest, None),
                };
                Some(Command::Break(Location::parse(&location)?, condition))
            }
            "trace" => Some(Command::Trace(Location::parse(&rest())?)),
            "watch" => {
                let address = parse_address(parts.get(1)?).ok()?;
                let size = match parts.get(2) {
                    Some(size) => size.parse().ok()?,
                    None => 4,
                };
                Some(Command::Watch(address, size))
            }
            "delete" | "d" => parse_id(parts.get(1)).map(Command::Delete),
            "enable" => parse_id(parts.get(1)).map(Command::Enable),
            "disable" => parse_id(parts.get(1)).map(Command::Disable),
            "breakpoints" | "info" if parts.len() == 1 || parts.get(1) == Some(&"breakpoints") => {
                Some(Command::Breakpoints)
            }
            "continue" | "c" => Some(Command::Continue),
            "step" | "s" => Some(Command::Step),
            "stepi" | "si" => Some(Command::StepInstruction),
            "next" | "n" => Some(Command::Next),
            "nexti" | "ni" => Some(Command::NextInstruction),
            "finish" | "f" => Some(Command::Finish),
            "until" | "u" => Some(Command::Until(Location::parse(&rest())?)),
            "jump" | "j" => Some(Command::Jump(Location::parse(&rest())?)),
            "interrupt" | "i" => Some(Command::Interrupt),
            "backtrace" | "bt" => match parts.get(1) {
                Some(&"full") => Some(Command::FullBacktrace),
                _ => Some(Command::Backtrace),
            },
            "threads" => Some(Command::Threads),
            "thread" | "t" => parts.get(1).map(|id| Command::Thread(id.to_string())),
            "registers" | "regs" => Some(Command::Registers),
            "set" => {
                let assignment = rest();
                let (name, value) = assignment.split_once('=')?;
                let name = name.trim().trim_start_matches('$');
                (!name.is_empty()).then(|| Command::SetRegister(name.to_string(), value.trim().to_string()))
            }
            "modules" | "lm" => Some(Command::Modules),
            "x" | "memory" => {
                let address = parse_address(parts.get(1)?).ok()?;
                let length = match parts.get(2) {
                    Some(length) => length.parse().ok()?,
                    None => 64,
                };
                Some(Command::Memory(address, length))
            }
            "print" | "p" => {
                let expression = rest();
                (!expression.is_empty()).then_some(Command::Print(expression))
            }
            "disassemble" | "disas" => Some(Command::Disassemble(Location::parse(&rest()))),
            "cdb" | "!" => {
                let raw = rest();
                (!raw.is_empty()).then_some(Command::Raw(raw))
            }
            "detach" => Some(Command::Detach),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
