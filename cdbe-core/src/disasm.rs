//! 逆アセンブル機能
//!
//! CDB の `u` コマンドの出力を解析し、`x module!function` の結果から
//! 逆アセンブルする範囲を決めます。

use cdbe_mi::utils::parse_cdb_hex;
use std::collections::HashMap;

/// アドレス指定時に前後へ広げるバイト数の合計
pub const DISASSEMBLER_RANGE: u64 = 512;

/// `u` の出力1行
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisassemblerLine {
    /// 命令のアドレス（ラベル行は 0）
    pub address: u64,
    /// `.asm source_line` で付く行番号
    pub source_line: Option<u32>,
    /// 命令のバイト列（16進）
    pub bytes: String,
    pub mnemonic: String,
    pub operands: String,
    /// `app!main [c:\src\main.cpp @ 18]:` のような関数ラベル
    pub label: Option<String>,
}

impl DisassemblerLine {
    pub fn is_label(&self) -> bool {
        self.label.is_some()
    }
}

/// CDB のアドレス表記か（`00000001`3f7ebe80` または8桁以上の16進数）
fn is_address_token(token: &str) -> bool {
    token.len() >= 8 && token.chars().all(|c| c.is_ascii_hexdigit() || c == '`')
}

/// 先頭の空白区切りの語と残りを返す
fn split_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(pos) => Some((&s[..pos], s[pos..].trim_start())),
        None => Some((s, "")),
    }
}

/// `u` の出力を解析する
pub fn parse_disassembly(text: &str) -> Vec<DisassemblerLine> {
    text.lines().filter_map(parse_disassembly_line).collect()
}

fn parse_disassembly_line(line: &str) -> Option<DisassemblerLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (first, rest) = split_token(trimmed)?;
    let mut result = DisassemblerLine::default();
    let (address_token, rest) = if is_address_token(first) {
        (first, rest)
    } else if first.chars().all(|c| c.is_ascii_digit()) {
        let (second, rest) = split_token(rest)?;
        if !is_address_token(second) {
            return None;
        }
        result.source_line = first.parse().ok();
        (second, rest)
    } else if trimmed.ends_with(':') {
        result.label = Some(trimmed.trim_end_matches(':').to_string());
        return Some(result);
    } else {
        return None;
    };
    result.address = parse_cdb_hex(address_token)?;
    if let Some((bytes, rest)) = split_token(rest) {
        result.bytes = bytes.to_string();
        if let Some((mnemonic, operands)) = split_token(rest) {
            result.mnemonic = mnemonic.to_string();
            result.operands = operands.trim_end().to_string();
        }
    }
    Some(result)
}

/// `x` の出力1行からアドレスを取り出す
///
/// ```text
/// 00000001`3f7ebe80 module!foo (void)
/// ```
pub fn resolved_address(line: &str) -> Option<u64> {
    let token = line.split_whitespace().next()?;
    if !is_address_token(token) {
        return None;
    }
    parse_cdb_hex(token)
}

/// `x` の出力全体からアドレスを取り出す
pub fn parse_symbol_addresses(reply: &str) -> Vec<u64> {
    reply.lines().filter_map(resolved_address).collect()
}

/// `needle` 以下で最も近い関数アドレスを選ぶ
///
/// 候補が1つならそれを、`needle` 以下のものがなければ先頭を返す。
pub fn closest_function_address(addresses: &[u64], needle: u64) -> Option<u64> {
    match addresses {
        [] => None,
        [only] => Some(*only),
        _ => addresses
            .iter()
            .filter(|a| **a <= needle)
            .max()
            .or_else(|| addresses.first())
            .copied(),
    }
}

/// `module!function` からアドレスへのキャッシュ
#[derive(Debug, Default)]
pub struct SymbolAddressCache {
    map: HashMap<String, Vec<u64>>,
}

impl SymbolAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&[u64]> {
        self.map.get(symbol).map(Vec::as_slice)
    }

    pub fn insert(&mut self, symbol: impl Into<String>, addresses: Vec<u64>) {
        self.map.entry(symbol.into()).or_default().extend(addresses);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// 逆アセンブルするシンボル名（モジュールが不明なら `*!function`）
pub fn symbol_name(module: &str, function: &str) -> String {
    let module = if module.is_empty() { "*" } else { module };
    format!("{}!{}", module, function)
}

/// 逆アセンブルの範囲
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassemblyPlan {
    pub start: u64,
    pub end: u64,
    /// 関数の候補が複数あった場合の説明
    pub message: Option<String>,
}

impl DisassemblyPlan {
    /// アドレスの前後 `DISASSEMBLER_RANGE / 2` バイト
    pub fn around(address: u64) -> Self {
        let half = DISASSEMBLER_RANGE / 2;
        Self {
            start: address.saturating_sub(half),
            end: address.saturating_add(half),
            message: None,
        }
    }

    pub fn command(&self) -> String {
        format!("u 0x{:x} 0x{:x}", self.start, self.end)
    }
}

/// 解決した関数アドレスから範囲を決める
pub fn plan_disassembly(addresses: &[u64], agent_address: u64, function: &str) -> Option<DisassemblyPlan> {
    let half = DISASSEMBLER_RANGE / 2;
    let mut message = None;
    let (function_address, end) = if agent_address != 0 {
        (
            closest_function_address(addresses, agent_address),
            agent_address.saturating_add(half),
        )
    } else {
        let first = addresses.first().copied();
        if addresses.len() > 1 {
            let list: Vec<String> = addresses.iter().map(|a| format!("0x{:x}", a)).collect();
            message = Some(format!(
                "Several overloads of function '{}()' were found ({}), using 0x{:x}.",
                function,
                list.join(", "),
                first.unwrap_or(0)
            ));
        }
        (first, first.unwrap_or(0).saturating_add(half))
    };
    match function_address {
        Some(start) => {
            let end = match end % 8 {
                0 => end,
                remainder => end + (8 - remainder),
            };
            Some(DisassemblyPlan { start, end, message })
        }
        None if agent_address != 0 => Some(DisassemblyPlan::around(agent_address)),
        None => None,
    }
}
