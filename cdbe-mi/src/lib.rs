//! CDB 拡張ライブラリ応答の解析
//!
//! このクレートは、拡張ライブラリが返す GDBMI 形式のテキストの解析機能を提供します。
//! 値ツリーとパーサ、スタックフレームやスレッドなどのレコード、Windows 例外、
//! ソースパスのマッピングを扱います。I/O は行いません。

pub mod value;
pub mod parser;
pub mod records;
pub mod exception;
pub mod source_map;
pub mod utils;

pub use value::{MiData, MiValue};
pub use parser::{parse, MiParseError};
pub use records::{
    parse_breakpoint_report, parse_frames, parse_modules, parse_registers, parse_threads,
    BreakpointReport, Frame, Module, Register, RegisterKind, ReportedLocation, ThreadInfo,
    ThreadList,
};
pub use exception::WinException;
pub use source_map::{
    clean_path, map_source_path, to_native_separators, uppercase_drive_letter, MappingDirection,
    SourcePathMapping,
};

/// 応答解析の結果型
pub type Result<T> = anyhow::Result<T>;
