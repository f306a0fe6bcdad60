//! cdbe デバッガエンジンのコア機能
//!
//! このクレートは、パイプ越しに CDB を操作するエンジンの中核となるロジックを提供します。
//! コマンドの送信と応答の対応付け、セッション状態の管理、停止理由の解析、
//! ブレークポイントの同期を統合します。

pub mod breakpoint;
pub mod callback;
pub mod command;
pub mod demux;
pub mod disasm;
pub mod dispatcher;
pub mod engine;
pub mod errors;
mod handlers;
pub mod line_correction;
mod operations;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod sink;
pub mod stack;
pub mod stop;

pub use breakpoint::{Breakpoint, BreakpointParameters, BreakpointType, ModelId, WatchAccess};
pub use command::{Command, Location};
pub use disasm::DisassemblerLine;
pub use engine::CdbEngine;
pub use errors::EngineError;
pub use session::{EngineState, Phase};
pub use settings::{EngineSettings, RunParameters, RuntimeFlavour};
pub use sink::{EngineSink, LogChannel};

// 他のクレートから使用するために再エクスポート
pub use cdbe_mi::{Frame, MiValue, Module, Register, SourcePathMapping, ThreadList, WinException};
pub use cdbe_target::{CdbProcess, StartMode, Transport, TransportEvent};

/// エンジンの結果型
pub type Result<T> = anyhow::Result<T>;
