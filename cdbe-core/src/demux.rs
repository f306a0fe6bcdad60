//! CDB 出力の振り分け
//!
//! 1行ずつ受け取り、拡張ライブラリの通知、組み込みコマンドの出力、
//! それ以外のテキストに分類します。
//!
//! ```text
//! Idle ──<token>T<──▶ CollectingBuiltin(T) ──<token>T>──▶ Idle
//! ```
//!
//! 拡張ライブラリの通知は状態に関係なくその場で処理し、分割されたものは
//! `remainingChunks` が 0 になるまで連結します。

use crate::protocol::{check_command_token, parse_extension_frame, strip_prompts};
use crate::Result;
use regex::Regex;
use tracing::{trace, warn};

/// 振り分けの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// 組み立て済みの拡張ライブラリの通知
    Extension {
        kind: char,
        token: i64,
        service: String,
        payload: String,
    },
    /// 組み込みコマンドの出力がそろった
    BuiltinDone { token: u32, text: String },
    /// CDB のバージョン表示
    Version { major: u32, minor: u32 },
    /// `ModLoad:` 行（モジュールのパス）
    ModuleLoaded(String),
    /// その他のテキスト
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    CollectingBuiltin { token: u32, text: String },
}

pub struct Demux {
    state: State,
    /// 分割された拡張ライブラリ通知の途中
    extension_buffer: String,
    version_pattern: Regex,
    module_load_pattern: Regex,
}

impl Demux {
    pub fn new() -> Result<Self> {
        // 例: Microsoft (R) Windows Debugger Version 6.12.0002.633 AMD64
        let version_pattern = Regex::new(r"^Microsoft \(R\) Windows Debugger Version (\d+)\.(\d+)")?;
        // 例: ModLoad: 00000000`77ba0000 00000000`77bb6000   C:\Windows\system32\ntdll.dll
        let module_load_pattern = Regex::new(r"^ModLoad: +\S+ +\S+ +(.+)$")?;
        Ok(Self {
            state: State::Idle,
            extension_buffer: String::new(),
            version_pattern,
            module_load_pattern,
        })
    }

    /// 組み込みコマンドの出力を収集中か
    pub fn is_collecting(&self) -> bool {
        matches!(self.state, State::CollectingBuiltin { .. })
    }

    /// 状態を初期化する
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.extension_buffer.clear();
    }

    /// 1行を処理する
    pub fn feed(&mut self, line: &str) -> Option<DemuxEvent> {
        let line = strip_prompts(line);

        if let Some(frame) = parse_extension_frame(line) {
            self.extension_buffer.push_str(frame.payload);
            if frame.remaining_chunks > 0 {
                trace!("Extension chunk, {} remaining", frame.remaining_chunks);
                return None;
            }
            return Some(DemuxEvent::Extension {
                kind: frame.kind,
                token: frame.token,
                service: frame.service.to_string(),
                payload: std::mem::take(&mut self.extension_buffer),
            });
        }

        let token = check_command_token(line);
        match &mut self.state {
            State::CollectingBuiltin { token: current, text } => match token {
                Some((t, false)) if t == *current => {
                    let text = std::mem::take(text);
                    self.state = State::Idle;
                    Some(DemuxEvent::BuiltinDone { token: t, text })
                }
                _ => {
                    if matches!(token, Some((_, true))) {
                        warn!("Unexpected start token while collecting builtin output: {}", line);
                    }
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(line);
                    None
                }
            },
            State::Idle => match token {
                Some((t, true)) => {
                    self.state = State::CollectingBuiltin {
                        token: t,
                        text: String::new(),
                    };
                    None
                }
                Some((t, false)) => {
                    warn!("Unexpected end token {} outside of builtin output", t);
                    None
                }
                None => Some(self.classify_text(line)),
            },
        }
    }

    fn classify_text(&self, line: &str) -> DemuxEvent {
        if let Some(caps) = self.version_pattern.captures(line) {
            let major = caps[1].parse().unwrap_or(0);
            let minor = caps[2].parse().unwrap_or(0);
            return DemuxEvent::Version { major, minor };
        }
        if let Some(caps) = self.module_load_pattern.captures(line) {
            return DemuxEvent::ModuleLoaded(caps[1].trim().to_string());
        }
        DemuxEvent::Text(line.to_string())
    }
}

/// CDB 自身がブレークポイントの行を補正するバージョンか
pub fn has_auto_breakpoint_correction(major: u32, minor: u32) -> bool {
    major > 6 || (major == 6 && (2..10).contains(&minor))
}
