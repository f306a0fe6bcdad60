//! CDB プロセスとの通信
//!
//! このクレートは、CDB を子プロセスとして起動しパイプ越しに通信するための
//! 低レベル機能を提供します。起動コマンドラインの生成、出力の行分割、
//! デバッグ対象への割り込みを行います。

pub mod launch;
pub mod line_buffer;
pub mod transport;
pub mod process;
pub mod interrupter;

pub use launch::{LaunchCommand, LaunchError, LaunchParameters, StartMode};
pub use line_buffer::LineBuffer;
pub use transport::{Transport, TransportEvent};
pub use process::CdbProcess;
pub use interrupter::Interrupter;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
