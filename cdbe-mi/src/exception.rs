//! Windows 例外の記述
//!
//! 拡張ライブラリが `exception` 通知や停止理由として送ってくる
//! `exceptionCode` などのフィールドを解釈します。

use crate::value::MiValue;
use std::fmt::Write;

pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xc000_0005;
pub const EXCEPTION_ARRAY_BOUNDS_EXCEEDED: u32 = 0xc000_008c;
pub const EXCEPTION_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
pub const EXCEPTION_FLT_DIVIDE_BY_ZERO: u32 = 0xc000_008e;
pub const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xc000_001d;
pub const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xc000_0094;
pub const EXCEPTION_INT_OVERFLOW: u32 = 0xc000_0095;
pub const EXCEPTION_STACK_OVERFLOW: u32 = 0xc000_00fd;
pub const EXCEPTION_HEAP_CORRUPTION: u32 = 0xc000_0374;
pub const EXCEPTION_STACK_BUFFER_OVERRUN: u32 = 0xc000_0409;
/// `int 3`
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
/// Ctrl+C / Ctrl+Break
pub const EXCEPTION_CTRL_PRESSED: u32 = 0x4001_0005;
/// MSVC のスレッド名設定
pub const EXCEPTION_SET_THREAD_NAME: u32 = 0x406d_1388;
/// WOW64 エミュレーションの初期ブレークポイント
pub const EXCEPTION_WX86_BREAKPOINT: u32 = 0x4000_001f;
/// MSVC の C++ `throw`
pub const EXCEPTION_CPP: u32 = 0xe06d_7363;

/// デバッガ自身が起こす例外か（ブレークポイント、シングルステップ）
pub fn is_debugger_exception(code: u32) -> bool {
    code == EXCEPTION_BREAKPOINT || code == EXCEPTION_SINGLE_STEP
}

/// プロセスの継続が見込めない例外か
pub fn is_fatal_exception(code: u32) -> bool {
    !matches!(
        code,
        EXCEPTION_BREAKPOINT
            | EXCEPTION_SINGLE_STEP
            | EXCEPTION_CTRL_PRESSED
            | EXCEPTION_SET_THREAD_NAME
            | EXCEPTION_WX86_BREAKPOINT
            | EXCEPTION_CPP
    )
}

/// 例外コードの名前
pub fn exception_name(code: u32) -> Option<&'static str> {
    Some(match code {
        EXCEPTION_ACCESS_VIOLATION => "access violation",
        EXCEPTION_ARRAY_BOUNDS_EXCEEDED => "array bounds exceeded",
        EXCEPTION_DATATYPE_MISALIGNMENT => "data type misalignment",
        EXCEPTION_FLT_DIVIDE_BY_ZERO => "floating point division by zero",
        EXCEPTION_ILLEGAL_INSTRUCTION => "illegal instruction",
        EXCEPTION_INT_DIVIDE_BY_ZERO => "integer division by zero",
        EXCEPTION_INT_OVERFLOW => "integer overflow",
        EXCEPTION_STACK_OVERFLOW => "stack overflow",
        EXCEPTION_HEAP_CORRUPTION => "heap corruption",
        EXCEPTION_STACK_BUFFER_OVERRUN => "stack buffer overrun",
        EXCEPTION_BREAKPOINT => "breakpoint",
        EXCEPTION_SINGLE_STEP => "single step",
        EXCEPTION_CTRL_PRESSED => "Ctrl+C",
        EXCEPTION_SET_THREAD_NAME => "set thread name",
        EXCEPTION_WX86_BREAKPOINT => "Win32 x86 emulation subsystem breakpoint",
        EXCEPTION_CPP => "C++ exception",
        _ => return None,
    })
}

/// Windows 例外
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WinException {
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    pub info0: u64,
    pub info1: u64,
    pub first_chance: bool,
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl WinException {
    /// GDBMI のフィールドから構築する
    pub fn from_mi(value: &MiValue) -> Self {
        let num = |key: &str| value.get(key).and_then(MiValue::to_u64).unwrap_or(0);
        Self {
            code: num("exceptionCode") as u32,
            flags: num("exceptionFlags") as u32,
            address: num("exceptionAddress"),
            info0: num("exceptionInformation0"),
            info1: num("exceptionInformation1"),
            first_chance: num("exceptionFirstChance") != 0,
            file: value.str("exceptionFile").unwrap_or("").to_string(),
            line: num("exceptionLine") as u32,
            function: value.str("exceptionFunction").unwrap_or("").to_string(),
        }
    }

    pub fn is_debugger_exception(&self) -> bool {
        is_debugger_exception(self.code)
    }

    pub fn is_fatal(&self) -> bool {
        is_fatal_exception(self.code)
    }

    /// 人間向けの説明文を作る
    ///
    /// `include_location` が真なら関数名とソース位置を付け加える。
    pub fn describe(&self, include_location: bool) -> String {
        let mut out = format!("Exception at 0x{:x}, code: 0x{:08x}", self.address, self.code);
        if let Some(name) = exception_name(self.code) {
            let _ = write!(out, ": {}", name);
        }
        if self.code == EXCEPTION_ACCESS_VIOLATION {
            let action = match self.info0 {
                0 => "read",
                8 => "execute",
                _ => "write",
            };
            let _ = write!(out, " ({} access to 0x{:x})", action, self.info1);
        }
        let _ = write!(out, ", flags=0x{:x}", self.flags);
        if self.first_chance {
            out.push_str(" (first chance)");
        }
        if include_location {
            if !self.function.is_empty() {
                let _ = write!(out, " in {}", self.function);
            }
            if !self.file.is_empty() {
                let _ = write!(out, " [{}:{}]", self.file, self.line);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_from_mi_and_describe() {
        let v = parse(
            r#"{exceptionCode="3221225477",exceptionFlags="0",exceptionAddress="4198400",exceptionInformation0="1",exceptionInformation1="0",exceptionFirstChance="1",exceptionFunction="app!crash",exceptionFile="C:\\src\\main.cpp",exceptionLine="12"}"#,
        )
        .unwrap();
        let e = WinException::from_mi(&v);
        assert_eq!(e.code, EXCEPTION_ACCESS_VIOLATION);
        assert!(e.first_chance);
        assert!(e.is_fatal());
        let text = e.describe(true);
        assert!(text.starts_with("Exception at 0x401000, code: 0xc0000005: access violation (write access to 0x0)"));
        assert!(text.contains("(first chance)"));
        assert!(text.ends_with("in app!crash [C:\\src\\main.cpp:12]"));
        assert!(!e.describe(false).contains("app!crash"));
    }

    #[test]
    fn test_classification() {
        assert!(is_debugger_exception(EXCEPTION_BREAKPOINT));
        assert!(is_debugger_exception(EXCEPTION_SINGLE_STEP));
        assert!(!is_debugger_exception(EXCEPTION_CPP));
        assert!(!is_fatal_exception(EXCEPTION_CPP));
        assert!(is_fatal_exception(EXCEPTION_STACK_OVERFLOW));
    }
}
