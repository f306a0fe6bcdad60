//! コマンドディスパッチャ
//!
//! トークンの払い出しと、応答待ちコマンドの表を管理します。
//! 書き込みそのものは行わず、送るべきテキストを返します。
//!
//! 組み込みコマンドは出力の取り違えを防ぐため1つずつ送ります。
//! 組み込みコマンドの応答待ちの間に投げられたコマンドは、順序を保つため
//! 種類によらずすべて待ち行列に入ります。

use crate::callback::Callback;
use crate::protocol::{format_builtin, format_extension, CommandKind, DebuggerCommand, MAX_COMMAND_LENGTH};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// 応答待ちのコマンド
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub token: u32,
    pub kind: CommandKind,
    pub function: String,
    pub args: Option<String>,
    pub callback: Option<Callback>,
}

/// 送信するテキスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// CDB の標準入力へ書くテキスト
    pub text: String,
    /// ログに表示するコマンド
    pub echo: String,
    pub token: Option<u32>,
    /// 通常コマンドが CDB の上限を超えている
    pub too_long: bool,
}

/// `post` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Post {
    Write(Outgoing),
    /// 組み込みコマンドの完了待ち
    Queued,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    last_token: u32,
    pending: BTreeMap<u32, PendingCommand>,
    builtin_in_flight: Option<u32>,
    backlog: VecDeque<DebuggerCommand>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// コマンドを送信用テキストにする
    pub fn post(&mut self, command: DebuggerCommand) -> Post {
        if self.builtin_in_flight.is_some() || !self.backlog.is_empty() {
            debug!("Queueing \"{}\" behind a builtin command", command.display_text());
            self.backlog.push_back(command);
            return Post::Queued;
        }
        Post::Write(self.encode(command))
    }

    fn encode(&mut self, command: DebuggerCommand) -> Outgoing {
        let command = if command.kind == CommandKind::Script {
            command.into_script_extension()
        } else {
            command
        };
        let echo = command.display_text();
        match command.kind {
            CommandKind::Fire => Outgoing {
                too_long: echo.len() > MAX_COMMAND_LENGTH,
                text: format!("{}\n", echo),
                echo,
                token: None,
            },
            CommandKind::Builtin => {
                let token = self.register(command);
                self.builtin_in_flight = Some(token);
                Outgoing {
                    text: format_builtin(token, &echo),
                    echo,
                    token: Some(token),
                    too_long: false,
                }
            }
            CommandKind::Extension | CommandKind::Script => {
                let text = format_extension(self.last_token + 1, &command.function, command.args.as_deref()).concat();
                let token = self.register(command);
                Outgoing {
                    text,
                    echo,
                    token: Some(token),
                    too_long: false,
                }
            }
        }
    }

    fn register(&mut self, command: DebuggerCommand) -> u32 {
        self.last_token += 1;
        let token = self.last_token;
        debug!("Posting token {}: {}", token, command.display_text());
        self.pending.insert(
            token,
            PendingCommand {
                token,
                kind: command.kind,
                function: command.function,
                args: command.args,
                callback: command.callback,
            },
        );
        token
    }

    /// 応答を受け取ったコマンドを表から外す
    pub fn complete(&mut self, token: u32) -> Option<PendingCommand> {
        if self.builtin_in_flight == Some(token) {
            self.builtin_in_flight = None;
        }
        let command = self.pending.remove(&token);
        if command.is_none() {
            debug!("No pending command for token {}", token);
        }
        command
    }

    /// 送信できるようになった待ち行列のコマンドを1つ取り出す
    pub fn next_backlogged(&mut self) -> Option<Outgoing> {
        if self.builtin_in_flight.is_some() {
            return None;
        }
        let command = self.backlog.pop_front()?;
        Some(self.encode(command))
    }

    pub fn is_collecting_builtin(&self) -> bool {
        self.builtin_in_flight.is_some()
    }

    /// 応答待ちまたは未送信のコマンドがあるか
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.backlog.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_token(&self) -> u32 {
        self.last_token
    }

    /// セッション終了時に応答待ちを捨てる
    pub fn clear(&mut self) {
        self.last_token = 0;
        self.pending.clear();
        self.builtin_in_flight = None;
        self.backlog.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(post: Post) -> Outgoing {
        match post {
            Post::Write(out) => out,
            Post::Queued => panic!("command was queued"),
        }
    }

    #[test]
    fn test_tokens_strictly_increase() {
        let mut d = Dispatcher::new();
        let mut last = 0;
        for i in 0..20 {
            let out = written(d.post(DebuggerCommand::extension("threads", Callback::Threads)));
            let token = out.token.unwrap();
            assert!(token > last, "iteration {}", i);
            last = token;
        }
        assert_eq!(last, 20);
        assert_eq!(d.pending_count(), 20);
    }

    #[test]
    fn test_fire_has_no_token() {
        let mut d = Dispatcher::new();
        let out = written(d.post(DebuggerCommand::fire("g")));
        assert_eq!(out.text, "g\n");
        assert_eq!(out.token, None);
        assert!(!out.too_long);
        assert!(!d.has_pending());

        let out = written(d.post(DebuggerCommand::fire("x".repeat(MAX_COMMAND_LENGTH + 1))));
        assert!(out.too_long);
    }

    #[test]
    fn test_extension_text_uses_its_own_token() {
        let mut d = Dispatcher::new();
        let out = written(d.post(DebuggerCommand::extension("stack", Callback::Stack).with_args("unlimited")));
        assert_eq!(out.text, "!qtcreatorcdbext.stack -t 1.0 unlimited\n");
        assert_eq!(out.echo, "!qtcreatorcdbext.stack unlimited");
        assert_eq!(out.token, Some(1));
    }

    #[test]
    fn test_builtins_are_serialized() {
        let mut d = Dispatcher::new();
        let first = written(d.post(DebuggerCommand::builtin("~0 s", Callback::SelectThread)));
        assert_eq!(first.token, Some(1));
        assert!(d.is_collecting_builtin());

        assert_eq!(d.post(DebuggerCommand::builtin("~*kp", Callback::FullBacktrace)), Post::Queued);
        assert_eq!(d.post(DebuggerCommand::fire("g")), Post::Queued);
        assert!(d.next_backlogged().is_none());

        let done = d.complete(1).unwrap();
        assert_eq!(done.callback, Some(Callback::SelectThread));
        assert!(!d.is_collecting_builtin());

        let second = d.next_backlogged().unwrap();
        assert_eq!(second.token, Some(2));
        assert!(second.text.contains("~*kp"));
        assert!(d.next_backlogged().is_none());

        d.complete(2);
        assert_eq!(d.next_backlogged().unwrap().text, "g\n");
        assert!(!d.has_pending());
    }

    #[test]
    fn test_complete_unknown_token() {
        let mut d = Dispatcher::new();
        assert!(d.complete(42).is_none());
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut d = Dispatcher::new();
        d.post(DebuggerCommand::builtin("k", Callback::FullBacktrace));
        d.post(DebuggerCommand::fire("g"));
        d.clear();
        assert!(!d.has_pending());
        assert!(!d.is_collecting_builtin());
        assert_eq!(d.last_token(), 0);
    }
}
