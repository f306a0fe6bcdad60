//! ブレークポイントの行補正
//!
//! 空行、コメント、括弧だけの行、プリプロセッサ行に置かれたブレークポイントを
//! 次の文のある行へ移します。古い CDB は自分で補正しないため使います。

use std::fs;
use tracing::{debug, warn};

/// ソースファイルを読んで行番号を補正する
pub fn fix_line_number(path: &str, line: u32) -> u32 {
    match fs::read_to_string(path) {
        Ok(source) => {
            let fixed = correct_line(&source, line);
            if fixed != line {
                debug!("Moved breakpoint {}:{} to line {}", path, line, fixed);
            }
            fixed
        }
        Err(e) => {
            warn!("Unable to read {} for breakpoint correction: {}", path, e);
            line
        }
    }
}

/// `line`（1 始まり）以降で最初に文のある行を返す
///
/// 見つからなければ元の行を返す。
pub fn correct_line(source: &str, line: u32) -> u32 {
    if line == 0 {
        return line;
    }
    let mut in_comment = false;
    for (index, text) in source.lines().enumerate() {
        let code = strip_comments(text, &mut in_comment);
        if index + 1 >= line as usize && is_statement(&code) {
            return index as u32 + 1;
        }
    }
    line
}

fn is_statement(code: &str) -> bool {
    let trimmed = code.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    if trimmed.chars().all(|c| matches!(c, '{' | '}' | ';') || c.is_whitespace()) {
        return false;
    }
    !matches!(trimmed, "public:" | "private:" | "protected:" | "else")
}

/// コメントを取り除く。`in_comment` は行をまたぐ `/* */` の状態
fn strip_comments(text: &str, in_comment: &mut bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        if *in_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                *in_comment = false;
            }
            continue;
        }
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => break,
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                *in_comment = true;
            }
            _ => out.push(c),
        }
    }
    out
}
