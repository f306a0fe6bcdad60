//! 拡張コマンド応答のレコード
//!
//! `stack`, `threads`, `modules`, `registers`, `breakpoints` 各コマンドの
//! GDBMI 応答を型付きの構造体に変換します。

use crate::utils::parse_cdb_hex;
use crate::value::MiValue;

/// スタックフレーム
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// フレーム番号（0 が最上位）
    pub level: usize,
    /// 関数名
    pub function: String,
    /// モジュール名
    pub module: String,
    /// デバッガが報告したソースファイル
    pub file: Option<String>,
    /// 行番号
    pub line: u32,
    /// 命令アドレス
    pub address: u64,
    /// 言語（`js` など、ネイティブ以外の場合のみ）
    pub language: Option<String>,
    /// コンテキスト文字列
    pub context: String,
    /// ソース表示に使えるか（ソースパス正規化後に決まる）
    pub usable: bool,
}

impl Frame {
    /// ソースファイルを持つか
    pub fn has_file(&self) -> bool {
        self.file.as_deref().is_some_and(|f| !f.is_empty())
    }
}

/// フレームリストをパースする
///
/// 子要素を持たない項目は「続きあり」を表し、そこで打ち切る。
/// 戻り値の2番目は打ち切られたかどうか。
pub fn parse_frames(stack: &MiValue) -> (Vec<Frame>, bool) {
    let mut frames = Vec::with_capacity(stack.children().len());
    for (level, item) in stack.iter().enumerate() {
        if item.children().is_empty() {
            return (frames, true);
        }
        let mut frame = Frame {
            level,
            ..Default::default()
        };
        if let Some(full_name) = item.str("fullname") {
            frame.file = Some(full_name.to_string());
            frame.line = item.get("line").and_then(MiValue::to_u64).unwrap_or(0) as u32;
            frame.language = item.non_empty("language").map(str::to_string);
        }
        frame.function = item
            .non_empty("function")
            .or_else(|| item.str("func"))
            .unwrap_or("")
            .to_string();
        frame.module = item.str("from").unwrap_or("").to_string();
        frame.context = item.str("context").unwrap_or("").to_string();
        frame.address = item.str("address").and_then(parse_cdb_hex).unwrap_or(0);
        frames.push(frame);
    }
    (frames, false)
}

/// スレッド情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: String,
    pub target_id: String,
    pub name: String,
    pub state: String,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub address: u64,
}

/// スレッド一覧
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadList {
    pub threads: Vec<ThreadInfo>,
    /// 現在のスレッド ID
    pub current_id: Option<String>,
}

/// スレッド一覧をパースする
///
/// `{threads=[...],current-thread-id="0"}` 形式と、リスト単体の形式の両方を受け付ける。
pub fn parse_threads(value: &MiValue) -> ThreadList {
    let items = if value.is_list() {
        value
    } else {
        match value.get("threads") {
            Some(t) => t,
            None => return ThreadList::default(),
        }
    };
    let threads = items
        .iter()
        .map(|item| {
            let frame = item.get("frame");
            let frame_str = |key: &str| frame.and_then(|f| f.str(key)).unwrap_or("").to_string();
            ThreadInfo {
                id: item.str("id").unwrap_or("").to_string(),
                target_id: item.str("target-id").unwrap_or("").to_string(),
                name: item.str("name").unwrap_or("").to_string(),
                state: item.str("state").unwrap_or("").to_string(),
                function: frame_str("func"),
                file: frame_str("file"),
                line: frame
                    .and_then(|f| f.get("line"))
                    .and_then(MiValue::to_u64)
                    .unwrap_or(0) as u32,
                address: frame
                    .and_then(|f| f.str("addr"))
                    .and_then(parse_cdb_hex)
                    .unwrap_or(0),
            }
        })
        .collect();
    ThreadList {
        threads,
        current_id: value.non_empty("current-thread-id").map(str::to_string),
    }
}

/// モジュール情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub image: String,
    pub start: u64,
    pub end: u64,
    /// シンボルが読み込み済みか（`deferred` でない）
    pub symbols_read: bool,
}

/// モジュール一覧をパースする（リストでなければ `None`）
pub fn parse_modules(value: &MiValue) -> Option<Vec<Module>> {
    if !value.is_list() {
        return None;
    }
    Some(
        value
            .iter()
            .map(|m| Module {
                name: m.str("name").unwrap_or("").to_string(),
                image: m.str("image").unwrap_or("").to_string(),
                start: m.get("start").and_then(MiValue::to_u64).unwrap_or(0),
                end: m.get("end").and_then(MiValue::to_u64).unwrap_or(0),
                symbols_read: m.get("deferred").is_none(),
            })
            .collect(),
    )
}

/// レジスタの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Integer,
    Float,
    Vector,
    Other,
}

impl RegisterKind {
    /// 拡張ライブラリの型文字列（`I64`, `F80`, `V128` ...）から判定する
    pub fn from_reported_type(reported: &str) -> Self {
        match reported.chars().next() {
            Some('I') => RegisterKind::Integer,
            Some('F') => RegisterKind::Float,
            Some('V') => RegisterKind::Vector,
            _ => RegisterKind::Other,
        }
    }
}

/// レジスタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub description: String,
    pub reported_type: String,
    pub kind: RegisterKind,
    /// 16進数の値
    pub value: String,
    pub size: u32,
}

/// レジスタ一覧をパースする（リストでなければ `None`）
pub fn parse_registers(value: &MiValue) -> Option<Vec<Register>> {
    if !value.is_list() {
        return None;
    }
    Some(
        value
            .iter()
            .map(|r| {
                let reported_type = r.str("type").unwrap_or("").to_string();
                Register {
                    name: r.str("name").unwrap_or("").to_string(),
                    description: r.str("description").unwrap_or("").to_string(),
                    kind: RegisterKind::from_reported_type(&reported_type),
                    reported_type,
                    value: r.str("value").unwrap_or("").to_string(),
                    size: r.get("size").and_then(MiValue::to_u64).unwrap_or(0) as u32,
                }
            })
            .collect(),
    )
}

/// `breakpoints` 応答で報告されたブレークポイントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedLocation {
    FileAndLine,
    Function,
    Address,
    Unknown,
}

/// `breakpoints -v` の1項目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointReport {
    /// CDB 上の ID（応答 ID）
    pub id: String,
    pub pending: bool,
    pub enabled: bool,
    pub address: u64,
    pub module: String,
    pub file: Option<String>,
    pub line: u32,
    pub function: Option<String>,
    pub thread: Option<String>,
    pub pass_count: u32,
    pub location: ReportedLocation,
}

/// `breakpoints -v` の1項目をパースする
pub fn parse_breakpoint_report(value: &MiValue) -> BreakpointReport {
    let mut report = BreakpointReport {
        id: value.str("id").unwrap_or("").to_string(),
        pending: value.get("deferred").is_some_and(|d| d.data() != "0" && d.data() != "false"),
        enabled: matches!(value.str("enabled"), Some("true") | Some("1") | None),
        address: value.str("address").and_then(parse_cdb_hex).unwrap_or(0),
        module: value.str("module").unwrap_or("").to_string(),
        file: None,
        line: 0,
        function: None,
        thread: value.non_empty("thread").map(str::to_string),
        pass_count: value.get("passcount").and_then(MiValue::to_u64).unwrap_or(0) as u32,
        location: ReportedLocation::Unknown,
    };

    if let Some(file) = value.non_empty("file") {
        report.file = Some(file.to_string());
        report.line = value.get("line").and_then(MiValue::to_u64).unwrap_or(0) as u32;
        report.location = ReportedLocation::FileAndLine;
    } else if let Some(expression) = value.non_empty("expression") {
        classify_expression(expression, &mut report);
    } else if report.address != 0 {
        report.location = ReportedLocation::Address;
    }
    report
}

/// `` `module!file:line` ``, `module!function`, `0x1234` を振り分ける
fn classify_expression(expression: &str, report: &mut BreakpointReport) {
    let trimmed = expression.trim();
    if let Some(inner) = trimmed.strip_prefix('`').and_then(|s| s.strip_suffix('`')) {
        let (module, location) = split_module(inner);
        if report.module.is_empty() {
            report.module = module.to_string();
        }
        if let Some((file, line)) = location.rsplit_once(':') {
            if let Ok(line) = line.trim().parse() {
                report.file = Some(file.to_string());
                report.line = line;
                report.location = ReportedLocation::FileAndLine;
                return;
            }
        }
    }
    if trimmed.starts_with("0x") || trimmed.contains('`') {
        if let Some(address) = parse_cdb_hex(trimmed) {
            if report.address == 0 {
                report.address = address;
            }
            report.location = ReportedLocation::Address;
            return;
        }
    }
    let (module, function) = split_module(trimmed);
    if report.module.is_empty() {
        report.module = module.to_string();
    }
    report.function = Some(function.to_string());
    report.location = ReportedLocation::Function;
}

/// `module!rest` を分割する。ドライブ文字の `:` より前の `!` のみを区切りとみなす。
fn split_module(s: &str) -> (&str, &str) {
    match s.find('!') {
        Some(pos) if !s[..pos].contains(['\\', '/', ':']) => (&s[..pos], &s[pos + 1..]),
        _ => ("", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_parse_frames_incomplete() {
        let v = parse(
            r#"[frame={level="0",fullname="C:\\src\\main.cpp",line="18",function="main",from="app",address="0x0000000140001000"},frame={function="foo",from="app",address="0x10"},{}]"#,
        )
        .unwrap();
        let (frames, incomplete) = parse_frames(&v);
        assert!(incomplete);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].file.as_deref(), Some("C:\\src\\main.cpp"));
        assert_eq!(frames[0].line, 18);
        assert_eq!(frames[0].address, 0x1_4000_1000);
        assert!(!frames[1].has_file());
        assert_eq!(frames[1].level, 1);
    }

    #[test]
    fn test_parse_threads() {
        let v = parse(
            r#"{threads=[{id="0",target-id="1a2c",state="stopped",frame={func="main",addr="0x10",line="3"}},{id="1",target-id="1a30"}],current-thread-id="0"}"#,
        )
        .unwrap();
        let list = parse_threads(&v);
        assert_eq!(list.threads.len(), 2);
        assert_eq!(list.current_id.as_deref(), Some("0"));
        assert_eq!(list.threads[0].function, "main");
        assert_eq!(list.threads[0].address, 0x10);
    }

    #[test]
    fn test_register_kind() {
        assert_eq!(RegisterKind::from_reported_type("I64"), RegisterKind::Integer);
        assert_eq!(RegisterKind::from_reported_type("F80"), RegisterKind::Float);
        assert_eq!(RegisterKind::from_reported_type("V128"), RegisterKind::Vector);
        assert_eq!(RegisterKind::from_reported_type(""), RegisterKind::Other);
    }

    #[test]
    fn test_modules_require_list() {
        let v = parse(r#"[{name="app",image="C:\\app.exe",start="0x1000",end="0x2000",deferred="true"}]"#).unwrap();
        let modules = parse_modules(&v).unwrap();
        assert_eq!(modules[0].start, 0x1000);
        assert!(!modules[0].symbols_read);
        assert!(parse_modules(&MiValue::scalar("", "junk")).is_none());
    }

    #[test]
    fn test_breakpoint_report_expressions() {
        let v = parse(r#"{id="100100",enabled="true",address="0x00007ff6`a103241c",module="untitled2",expression="`untitled2!C:\\src\\main.cpp:18`"}"#).unwrap();
        let r = parse_breakpoint_report(&v);
        assert!(!r.pending);
        assert_eq!(r.location, ReportedLocation::FileAndLine);
        assert_eq!(r.file.as_deref(), Some("C:\\src\\main.cpp"));
        assert_eq!(r.line, 18);
        assert_eq!(r.address, 0x7ff6_a103_241c);

        let v = parse(r#"{id="5",deferred="true",expression="MSVCR120!_CrtDbgReport"}"#).unwrap();
        let r = parse_breakpoint_report(&v);
        assert!(r.pending);
        assert_eq!(r.location, ReportedLocation::Function);
        assert_eq!(r.module, "MSVCR120");
        assert_eq!(r.function.as_deref(), Some("_CrtDbgReport"));
    }
}
