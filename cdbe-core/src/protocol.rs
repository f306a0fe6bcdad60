//! CDB とのワイヤプロトコル
//!
//! コマンドの種類ごとの書き出し形式と、出力行の判定を扱います。
//!
//! - 通常コマンド: `cmd\n`
//! - 組み込みコマンド: `.echo "<token>T<"` / `cmd` / `.echo "<token>T>"` の3行
//! - 拡張コマンド: `!qtcreatorcdbext.func -t T.N args\n`（引数が長ければ分割）

use crate::callback::Callback;
use cdbe_mi::MiValue;

/// 組み込みコマンドの出力を囲むトークン接頭辞
pub const TOKEN_PREFIX: &str = "<token>";

/// 拡張ライブラリのコマンド接頭辞
pub const EXTENSION_PREFIX: &str = "!qtcreatorcdbext.";

/// 拡張ライブラリの通知行の接頭辞
pub const EXTENSION_MARKER: &str = "<qtcreatorcdbext>|";

/// CDB の1コマンドの最大長
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// ` -t ` + トークン5桁 + `.` + 分割番号3桁 + 空白
pub const MAX_TOKEN_LENGTH: usize = 4 + 5 + 1 + 3 + 1;

/// プロンプト `0:000> ` の長さ
pub const PROMPT_LENGTH: usize = 7;

/// コマンドの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// 応答を待たない
    Fire,
    /// `.echo` で囲んで出力を回収する
    Builtin,
    /// 拡張ライブラリのコマンド
    Extension,
    /// 拡張ライブラリの `script` コマンドに詰め直す
    Script,
}

/// 送信するコマンド
#[derive(Debug, Clone, PartialEq)]
pub struct DebuggerCommand {
    pub function: String,
    pub args: Option<String>,
    pub kind: CommandKind,
    pub callback: Option<Callback>,
}

impl DebuggerCommand {
    pub fn new(function: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            function: function.into(),
            args: None,
            kind,
            callback: None,
        }
    }

    /// 応答を待たないコマンド
    pub fn fire(function: impl Into<String>) -> Self {
        Self::new(function, CommandKind::Fire)
    }

    /// 組み込みコマンド
    pub fn builtin(function: impl Into<String>, callback: Callback) -> Self {
        Self::new(function, CommandKind::Builtin).with_callback(callback)
    }

    /// 拡張コマンド
    pub fn extension(function: impl Into<String>, callback: Callback) -> Self {
        Self::new(function, CommandKind::Extension).with_callback(callback)
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// ログ表示用のコマンド文字列
    pub fn display_text(&self) -> String {
        let prefix = if self.kind == CommandKind::Extension {
            EXTENSION_PREFIX
        } else {
            ""
        };
        match &self.args {
            Some(args) if !args.is_empty() => format!("{}{} {}", prefix, self.function, args),
            _ => format!("{}{}", prefix, self.function),
        }
    }

    /// スクリプトコマンドを拡張コマンド `script` に詰め直す
    ///
    /// 引数があれば `function(args)` の呼び出し式にする。
    pub fn into_script_extension(self) -> DebuggerCommand {
        let args = match &self.args {
            Some(args) => format!("{}({})", self.function, args),
            None => self.function.clone(),
        };
        DebuggerCommand {
            function: "script".to_string(),
            args: Some(args),
            kind: CommandKind::Extension,
            callback: self.callback,
        }
    }
}

/// 応答の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Error,
}

/// コマンドへの応答
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub token: u32,
    pub result_class: ResultClass,
    pub data: MiValue,
}

impl Response {
    /// 組み込みコマンドの出力から作る
    pub fn builtin(token: u32, text: String) -> Self {
        Self {
            token,
            result_class: ResultClass::Done,
            data: MiValue::scalar("data", text),
        }
    }

    /// 拡張コマンドの `R`（成功）応答から作る
    ///
    /// GDBMI として解釈できなければ生のテキストをスカラーとして包む。
    pub fn extension_done(token: u32, payload: &str) -> Self {
        let data = match cdbe_mi::parse(payload) {
            Ok(value) => value.renamed("data"),
            Err(_) => MiValue::scalar("data", payload),
        };
        Self {
            token,
            result_class: ResultClass::Done,
            data,
        }
    }

    /// 拡張コマンドの `N`（失敗）応答から作る
    pub fn extension_error(token: u32, payload: &str) -> Self {
        Self {
            token,
            result_class: ResultClass::Error,
            data: MiValue::tuple("data", vec![MiValue::scalar("msg", payload)]),
        }
    }

    pub fn is_done(&self) -> bool {
        self.result_class == ResultClass::Done
    }

    /// エラーメッセージ（`msg` フィールド）
    pub fn msg(&self) -> &str {
        self.data.str("msg").unwrap_or("")
    }

    /// スカラーの応答テキスト
    pub fn text(&self) -> &str {
        self.data.data()
    }
}

/// 組み込みコマンドを `.echo` で囲む
pub fn format_builtin(token: u32, command: &str) -> String {
    format!(
        ".echo \"{prefix}{token}<\"\n{command}\n.echo \"{prefix}{token}>\"\n",
        prefix = TOKEN_PREFIX,
        token = token,
        command = command
    )
}

/// 拡張コマンドの送信行を作る
///
/// 引数が長い場合は `MAX_COMMAND_LENGTH` を超えないよう分割し、
/// 分割番号を `N-1` から `0` へ降順に振る。引数がなければ `.0` の1行。
pub fn format_extension(token: u32, function: &str, args: Option<&str>) -> Vec<String> {
    let prefix = format!("{}{}", EXTENSION_PREFIX, function);
    let args = match args {
        Some(args) if !args.is_empty() => args,
        _ => return vec![format!("{} -t {}.0\n", prefix, token)],
    };
    let max_chunk = MAX_COMMAND_LENGTH
        .saturating_sub(prefix.len() + MAX_TOKEN_LENGTH)
        .max(1);
    let chunks = split_at_char_boundaries(args, max_chunk);
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("{} -t {}.{} {}\n", prefix, token, count - 1 - i, chunk))
        .collect()
}

/// 最大 `max_len` バイトずつ、文字の途中で切らずに分割する
fn split_at_char_boundaries(s: &str, max_len: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let mut end = rest.len().min(max_len);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

/// 行頭が CDB のプロンプト `d:ddd> ` か
pub fn is_cdb_prompt(line: &str) -> bool {
    let b = line.as_bytes();
    b.len() >= PROMPT_LENGTH
        && b[0].is_ascii_digit()
        && b[1] == b':'
        && b[2].is_ascii_digit()
        && b[3].is_ascii_digit()
        && b[4].is_ascii_digit()
        && b[5] == b'>'
        && b[6] == b' '
}

/// 連続したプロンプトをすべて取り除く
pub fn strip_prompts(mut line: &str) -> &str {
    while is_cdb_prompt(line) {
        line = &line[PROMPT_LENGTH..];
    }
    line
}

/// `<token>32<`（開始）または `<token>32>`（終了）を判定する
///
/// 戻り値は `(トークン, 開始か)`。
pub fn check_command_token(line: &str) -> Option<(u32, bool)> {
    let rest = line.strip_prefix(TOKEN_PREFIX)?;
    if !rest.as_bytes().first()?.is_ascii_digit() {
        return None;
    }
    let is_start = match rest.as_bytes().last()? {
        b'<' => true,
        b'>' => false,
        _ => return None,
    };
    let token = rest[..rest.len() - 1].parse().ok()?;
    Some((token, is_start))
}

/// 拡張ライブラリの通知行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFrame<'a> {
    /// `R`（成功）、`N`（失敗）など
    pub kind: char,
    /// 応答先のトークン（-1 は要求なし）
    pub token: i64,
    /// 残りの分割数
    pub remaining_chunks: u32,
    /// サービス名（`session_idle` など）
    pub service: &'a str,
    pub payload: &'a str,
}

/// `<qtcreatorcdbext>|type|token|remaining|service|payload` を分解する
pub fn parse_extension_frame(line: &str) -> Option<ExtensionFrame<'_>> {
    let rest = line.strip_prefix(EXTENSION_MARKER)?;
    let mut parts = rest.splitn(5, '|');
    let kind = parts.next()?.chars().next()?;
    let token = parts.next()?.trim().parse().ok()?;
    let remaining_chunks = parts.next()?.trim().parse().ok()?;
    let service = parts.next()?;
    let payload = parts.next()?;
    Some(ExtensionFrame {
        kind,
        token,
        remaining_chunks,
        service,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_builtin() {
        assert_eq!(
            format_builtin(7, "lm m wow64"),
            ".echo \"<token>7<\"\nlm m wow64\n.echo \"<token>7>\"\n"
        );
    }

    #[test]
    fn test_format_extension_without_args() {
        assert_eq!(format_extension(3, "pid", None), vec!["!qtcreatorcdbext.pid -t 3.0\n"]);
        assert_eq!(
            format_extension(4, "stack", Some("unlimited")),
            vec!["!qtcreatorcdbext.stack -t 4.0 unlimited\n"]
        );
    }

    #[test]
    fn test_format_extension_chunks_long_arguments() {
        let args: String = (0..10000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let lines = format_extension(12, "locals", Some(&args));
        assert_eq!(lines.len(), 3);
        let mut restored = String::new();
        for (i, line) in lines.iter().enumerate() {
            assert!(line.len() - 1 <= MAX_COMMAND_LENGTH);
            let header = format!("!qtcreatorcdbext.locals -t 12.{} ", lines.len() - 1 - i);
            assert!(line.starts_with(&header));
            restored.push_str(&line[header.len()..line.len() - 1]);
        }
        assert_eq!(restored, args);
    }

    #[test]
    fn test_script_repacking() {
        let cmd = DebuggerCommand::new("print", CommandKind::Script).with_args("sys.version");
        let ext = cmd.into_script_extension();
        assert_eq!(ext.kind, CommandKind::Extension);
        assert_eq!(ext.function, "script");
        assert_eq!(ext.args.as_deref(), Some("print(sys.version)"));

        let bare = DebuggerCommand::new("theDumper = Dumper()", CommandKind::Script).into_script_extension();
        assert_eq!(bare.args.as_deref(), Some("theDumper = Dumper()"));
    }

    #[test]
    fn test_prompt_stripping() {
        assert!(is_cdb_prompt("0:000> "));
        assert!(!is_cdb_prompt("0:000>"));
        assert!(!is_cdb_prompt("a:000> x"));
        assert_eq!(strip_prompts("0:000> 0:001> text"), "text");
        assert_eq!(strip_prompts("text"), "text");
    }

    #[test]
    fn test_check_command_token() {
        assert_eq!(check_command_token("<token>32<"), Some((32, true)));
        assert_eq!(check_command_token("<token>32>"), Some((32, false)));
        assert_eq!(check_command_token("<token>x32>"), None);
        assert_eq!(check_command_token("<token>32"), None);
        assert_eq!(check_command_token("token>32>"), None);
    }

    #[test]
    fn test_parse_extension_frame() {
        let f = parse_extension_frame("<qtcreatorcdbext>|R|5|0|pid|1234").unwrap();
        assert_eq!(f.kind, 'R');
        assert_eq!(f.token, 5);
        assert_eq!(f.remaining_chunks, 0);
        assert_eq!(f.service, "pid");
        assert_eq!(f.payload, "1234");

        let f = parse_extension_frame("<qtcreatorcdbext>|N|-1|0|event|a|b").unwrap();
        assert_eq!(f.token, -1);
        assert_eq!(f.payload, "a|b");
        assert!(parse_extension_frame("<qtcreatorcdbext>|R|5").is_none());
    }

    #[test]
    fn test_extension_responses() {
        let r = Response::extension_done(1, "1234");
        assert!(r.is_done());
        assert_eq!(r.text(), "1234");
        let r = Response::extension_done(1, r#"[{name="app"}]"#);
        assert!(r.data.is_list());
        assert_eq!(r.data.name(), "data");
        let r = Response::extension_error(1, "no thread");
        assert!(!r.is_done());
        assert_eq!(r.msg(), "no thread");
    }
}
