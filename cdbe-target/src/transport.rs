//! デバッガプロセスとの通信路

use crate::launch::{LaunchCommand, LaunchError};
use crate::Result;

/// 通信路から届くイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 標準出力の1行（改行は含まない）
    Line(String),
    /// 標準エラー出力の1行
    Stderr(String),
    /// プロセス終了
    Exited { code: Option<i32> },
    /// 読み取りエラー
    Error(String),
}

/// デバッガプロセスとの通信路
///
/// 書き込みの可否（セッションがアクセス可能か）は呼び出し側が管理する。
pub trait Transport {
    /// プロセスを起動する
    fn start(&mut self, command: &LaunchCommand) -> std::result::Result<(), LaunchError>;

    /// テキストをそのまま書き込む
    fn write(&mut self, text: &str) -> Result<()>;

    /// プロセスが実行中か
    fn is_running(&self) -> bool;

    /// デバッガプロセスの ID
    fn pid(&self) -> Option<u32>;

    /// プロセスを強制終了する
    fn kill(&mut self);

    /// デバッグ対象に割り込みをかける（ブレークインを起こす）
    fn interrupt(&mut self, inferior_pid: u32) -> Result<()>;
}
