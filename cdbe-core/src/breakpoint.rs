//! ブレークポイント管理
//!
//! 論理的なブレークポイント（モデル ID）と、CDB 上の ID（応答 ID）を
//! 対応付けて管理します。応答 ID は `100000 + modelId * 100` で、
//! 曖昧なシンボルから展開したサブブレークポイントには `+1..+99` を振ります。

use cdbe_mi::{map_source_path, to_native_separators, BreakpointReport, MappingDirection, SourcePathMapping};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

/// ブレークポイントID
pub type ModelId = u32;

/// 応答 ID の基点
pub const RESPONSE_ID_BASE: u32 = 100_000;

/// 1つのブレークポイントあたりのサブブレークポイントの上限
pub const MAX_SUB_BREAKPOINTS: u32 = 99;

/// ブレークポイントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointType {
    FileAndLine,
    Function,
    Address,
    /// アドレスへのデータブレークポイント
    WatchpointAtAddress,
    /// `main` で停止
    AtMain,
    AtThrow,
    AtCatch,
    AtFork,
    AtSysCall,
    WatchpointAtExpression,
}

impl BreakpointType {
    pub fn name(self) -> &'static str {
        match self {
            BreakpointType::FileAndLine => "file and line",
            BreakpointType::Function => "function",
            BreakpointType::Address => "address",
            BreakpointType::WatchpointAtAddress => "watchpoint at address",
            BreakpointType::AtMain => "at main",
            BreakpointType::AtThrow => "at throw",
            BreakpointType::AtCatch => "at catch",
            BreakpointType::AtFork => "at fork",
            BreakpointType::AtSysCall => "at syscall",
            BreakpointType::WatchpointAtExpression => "watchpoint at expression",
        }
    }
}

/// CDB で扱える種類か
pub fn accepts_breakpoint(kind: BreakpointType) -> bool {
    matches!(
        kind,
        BreakpointType::FileAndLine
            | BreakpointType::Function
            | BreakpointType::Address
            | BreakpointType::WatchpointAtAddress
            | BreakpointType::AtMain
    )
}

/// データブレークポイントのアクセス種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchAccess {
    #[default]
    Write,
    Read,
    Execute,
}

impl WatchAccess {
    fn as_char(self) -> char {
        match self {
            WatchAccess::Write => 'w',
            WatchAccess::Read => 'r',
            WatchAccess::Execute => 'e',
        }
    }
}

/// ブレークポイントの設定値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointParameters {
    pub kind: BreakpointType,
    pub file: Option<String>,
    pub line: u32,
    pub function: String,
    pub module: String,
    pub address: u64,
    /// データブレークポイントのサイズ（1, 2, 4, 8）
    pub size: u32,
    pub access: WatchAccess,
    /// 停止時にエンジンが評価する条件
    pub condition: String,
    /// 停止時に出力するメッセージ
    pub message: String,
    pub enabled: bool,
    pub pending: bool,
    pub one_shot: bool,
    /// 停止せずにログだけ出す
    pub tracepoint: bool,
    pub ignore_count: u32,
    pub thread: Option<String>,
}

impl BreakpointParameters {
    pub fn new(kind: BreakpointType) -> Self {
        Self {
            kind,
            file: None,
            line: 0,
            function: String::new(),
            module: String::new(),
            address: 0,
            size: 0,
            access: WatchAccess::default(),
            condition: String::new(),
            message: String::new(),
            enabled: true,
            pending: true,
            one_shot: false,
            tracepoint: false,
            ignore_count: 0,
            thread: None,
        }
    }

    pub fn file_and_line(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: Some(file.into()),
            line,
            ..Self::new(BreakpointType::FileAndLine)
        }
    }

    pub fn function(function: impl Into<String>) -> Self {
        let function = function.into();
        let (module, function) = match function.split_once('!') {
            Some((module, function)) => (module.to_string(), function.to_string()),
            None => (String::new(), function),
        };
        Self {
            function,
            module,
            ..Self::new(BreakpointType::Function)
        }
    }

    pub fn address(address: u64) -> Self {
        Self {
            address,
            ..Self::new(BreakpointType::Address)
        }
    }

    pub fn watchpoint(address: u64, size: u32) -> Self {
        Self {
            address,
            size,
            ..Self::new(BreakpointType::WatchpointAtAddress)
        }
    }

    pub fn at_main(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: "main".to_string(),
            ..Self::new(BreakpointType::AtMain)
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }
}

/// 曖昧なシンボルから展開されたブレークポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBreakpoint {
    pub response_id: String,
    pub display_name: String,
    pub params: BreakpointParameters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub model_id: ModelId,
    pub response_id: String,
    pub display_name: String,
    pub params: BreakpointParameters,
    pub subs: Vec<SubBreakpoint>,
}

impl Breakpoint {
    /// CDB 上の数値 ID
    pub fn cdb_id(&self) -> u32 {
        cdb_id(self.model_id)
    }
}

/// モデル ID から CDB 上の数値 ID を求める
pub fn cdb_id(model_id: ModelId) -> u32 {
    RESPONSE_ID_BASE + model_id * 100
}

/// モデル ID から応答 ID を求める
pub fn response_id_for(model_id: ModelId) -> String {
    cdb_id(model_id).to_string()
}

/// ブレークポイントを追加するコマンド
///
/// ```text
/// ~1 bu100100 /1 `C:\src\main.cpp:18` 3
/// ```
pub fn add_command(params: &BreakpointParameters, mappings: &[SourcePathMapping], response_id: &str) -> String {
    let mut out = String::new();
    if let Some(thread) = &params.thread {
        let _ = write!(out, "~{} ", thread);
    }
    let verb = match params.kind {
        BreakpointType::Address => "bp",
        BreakpointType::WatchpointAtAddress => "ba",
        _ => "bu",
    };
    out.push_str(verb);
    out.push_str(response_id);
    out.push(' ');
    if params.kind == BreakpointType::WatchpointAtAddress {
        let size = if params.size == 0 { 1 } else { params.size };
        let _ = write!(out, "{}{} ", params.access.as_char(), size);
    }
    if params.one_shot {
        out.push_str("/1 ");
    }
    match params.kind {
        BreakpointType::FileAndLine => {
            let file = params.file.as_deref().unwrap_or("");
            let mapped = map_source_path(&to_native_separators(file), mappings, MappingDirection::SourceToDebugger);
            out.push('`');
            if !params.module.is_empty() {
                let _ = write!(out, "{}!", params.module);
            }
            let _ = write!(out, "{}:{}`", mapped, params.line);
        }
        BreakpointType::Address | BreakpointType::WatchpointAtAddress => {
            let _ = write!(out, "0x{:x}", params.address);
        }
        _ => {
            if !params.module.is_empty() {
                let _ = write!(out, "{}!", params.module);
            }
            let function = if params.kind == BreakpointType::AtMain && params.function.is_empty() {
                "main"
            } else {
                &params.function
            };
            out.push_str(function);
        }
    }
    if params.ignore_count > 0 {
        let _ = write!(out, " {}", params.ignore_count + 1);
    }
    out
}

/// ブレークポイントを削除するコマンド（サブブレークポイントも含めて）
pub fn clear_command(breakpoint: &Breakpoint) -> String {
    let id = breakpoint.cdb_id();
    if breakpoint.subs.is_empty() {
        format!("bc {}", id)
    } else {
        format!("bc {}-{}", id, id + breakpoint.subs.len() as u32)
    }
}

/// 有効化/無効化のコマンド
pub fn enable_command(response_id: &str, enabled: bool) -> String {
    format!("{} {}", if enabled { "be" } else { "bd" }, response_id)
}

/// `Matched: module!function+0x1b (00000001`3f7ebe80)` の1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousMatch {
    pub function: String,
    pub address: u64,
}

const AMBIGUOUS_ERROR: &str = "Ambiguous symbol error";
const MATCH_PREFIX: &str = "Matched: ";

/// `bu` の応答に曖昧なシンボルのエラーがあれば候補を取り出す
///
/// エラー行は最後か、その1つ前の行に出る。
pub fn parse_ambiguous_matches(reply: &str) -> Option<Vec<AmbiguousMatch>> {
    let lines: Vec<&str> = reply.split('\n').collect();
    let n = lines.len();
    let is_error = |i: usize| lines.get(i).is_some_and(|l| l.starts_with(AMBIGUOUS_ERROR));
    if !is_error(n - 1) && (n < 2 || !is_error(n - 2)) {
        return None;
    }
    Some(lines.iter().filter_map(|line| parse_match_line(line)).collect())
}

fn parse_match_line(line: &str) -> Option<AmbiguousMatch> {
    if !line.starts_with(MATCH_PREFIX) {
        return None;
    }
    let address_start = line.rfind('(')? + 1;
    let address_end = address_start + line[address_start..].find(')')?;
    let address_text: String = line[address_start..address_end].chars().filter(|c| *c != '`').collect();
    let address = u64::from_str_radix(&address_text, 16).ok()?;

    let mut function = line[MATCH_PREFIX.len()..address_start - 1].trim_end();
    if let Some(offset) = function.rfind('+') {
        if offset > 0 {
            function = &function[..offset];
        }
    }
    if let Some(bang) = function.find('!') {
        function = &function[bang + 1..];
    }
    Some(AmbiguousMatch {
        function: function.to_string(),
        address,
    })
}

/// ブレークポイントの一覧と、未解決のものの集合
#[derive(Debug, Default)]
pub struct BreakpointBook {
    breakpoints: BTreeMap<ModelId, Breakpoint>,
    pending: BTreeSet<ModelId>,
    next_model_id: ModelId,
}

impl BreakpointBook {
    pub fn new() -> Self {
        Self {
            next_model_id: 1,
            ..Default::default()
        }
    }

    /// 新しいブレークポイントを登録する（まだ CDB には送らない）
    pub fn create(&mut self, params: BreakpointParameters) -> ModelId {
        let model_id = self.next_model_id;
        self.next_model_id += 1;
        self.breakpoints.insert(
            model_id,
            Breakpoint {
                model_id,
                response_id: response_id_for(model_id),
                display_name: model_id.to_string(),
                params,
                subs: Vec::new(),
            },
        );
        model_id
    }

    pub fn get(&self, model_id: ModelId) -> Option<&Breakpoint> {
        self.breakpoints.get(&model_id)
    }

    pub fn get_mut(&mut self, model_id: ModelId) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&model_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// 削除する。未解決の集合からも必ず外す
    pub fn remove(&mut self, model_id: ModelId) -> Option<Breakpoint> {
        self.pending.remove(&model_id);
        self.breakpoints.remove(&model_id)
    }

    /// 未解決として登録する
    pub fn mark_pending(&mut self, model_id: ModelId) {
        if let Some(bp) = self.breakpoints.get_mut(&model_id) {
            bp.params.pending = true;
            self.pending.insert(model_id);
        }
    }

    pub fn is_pending(&self, model_id: ModelId) -> bool {
        self.pending.contains(&model_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 未解決の集合を空にする（セッションの開始時）
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = ModelId> + '_ {
        self.pending.iter().copied()
    }

    pub fn find_by_response_id(&self, response_id: &str) -> Option<&Breakpoint> {
        self.breakpoints.values().find(|bp| bp.response_id == response_id)
    }

    /// サブブレークポイントと、その親を探す
    pub fn find_sub(&self, response_id: &str) -> Option<(&Breakpoint, &SubBreakpoint)> {
        self.breakpoints
            .values()
            .find_map(|bp| bp.subs.iter().find(|s| s.response_id == response_id).map(|s| (bp, s)))
    }

    /// 応答 ID からブレークポイントと表示名を求める
    pub fn resolve(&self, response_id: &str) -> Option<(&Breakpoint, String)> {
        if let Some(bp) = self.find_by_response_id(response_id) {
            return Some((bp, bp.display_name.clone()));
        }
        self.find_sub(response_id)
            .map(|(bp, sub)| (bp, sub.display_name.clone()))
    }

    /// 曖昧なシンボルの候補からサブブレークポイントを作る
    ///
    /// 作成したサブブレークポイントを返す。`index` は 1 から。
    pub fn add_sub(&mut self, model_id: ModelId, index: u32, found: &AmbiguousMatch) -> Option<SubBreakpoint> {
        if index == 0 || index > MAX_SUB_BREAKPOINTS {
            return None;
        }
        let bp = self.breakpoints.get_mut(&model_id)?;
        let response_id = (bp.cdb_id() + index).to_string();
        let mut params = bp.params.clone();
        params.kind = BreakpointType::Address;
        params.address = found.address;
        params.function = found.function.clone();
        let sub = SubBreakpoint {
            display_name: format!("{}.{}", bp.display_name, index),
            response_id: response_id.clone(),
            params,
        };
        match bp.subs.iter_mut().find(|s| s.response_id == response_id) {
            Some(existing) => *existing = sub.clone(),
            None => bp.subs.push(sub.clone()),
        }
        Some(sub)
    }

    /// `breakpoints -v` の結果と突き合わせる
    ///
    /// 解決したものは未解決の集合から外す。
    pub fn reconcile(&mut self, reports: &[BreakpointReport]) -> Reconciliation {
        let mut message = String::new();
        let mut resolved = Vec::new();
        for report in reports {
            if report.id.is_empty() || report.pending {
                continue;
            }
            if let Some(model_id) = self.find_by_response_id(&report.id).map(|bp| bp.model_id) {
                if !self.pending.contains(&model_id) {
                    continue;
                }
                if let Some(bp) = self.breakpoints.get_mut(&model_id) {
                    apply_report(&mut bp.params, report);
                    format_report_line(&mut message, &bp.display_name, &report.id, &bp.params);
                }
                self.pending.remove(&model_id);
                resolved.push(model_id);
                continue;
            }
            // ランタイムが仕掛けた関数ブレークポイントは対応するものがない
            if report.location == cdbe_mi::ReportedLocation::Function {
                continue;
            }
            let parent = self.find_sub(&report.id).map(|(bp, _)| bp.model_id);
            if let Some(model_id) = parent {
                if let Some(bp) = self.breakpoints.get_mut(&model_id) {
                    if let Some(sub) = bp.subs.iter_mut().find(|s| s.response_id == report.id) {
                        apply_report(&mut sub.params, report);
                        format_report_line(&mut message, &sub.display_name, &report.id, &sub.params);
                    }
                    if self.pending.remove(&model_id) {
                        bp.params.pending = false;
                        resolved.push(model_id);
                    }
                }
            }
        }
        if self.pending.is_empty() {
            message.push_str("All breakpoints have been resolved.\n");
        } else {
            let _ = writeln!(message, "{} breakpoint(s) pending...", self.pending.len());
        }
        Reconciliation { message, resolved }
    }
}

/// 突き合わせの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub message: String,
    /// 今回解決したブレークポイント
    pub resolved: Vec<ModelId>,
}

fn apply_report(params: &mut BreakpointParameters, report: &BreakpointReport) {
    params.address = report.address;
    params.module = report.module.clone();
    params.pending = report.pending;
    params.enabled = report.enabled;
    params.file = report.file.clone();
    params.line = report.line;
}

fn format_report_line(out: &mut String, display_name: &str, response_id: &str, params: &BreakpointParameters) {
    let _ = write!(out, "Obtained breakpoint {} (#{})", display_name, response_id);
    if params.pending {
        out.push_str(", pending");
    } else {
        let _ = write!(out, ", at 0x{:x}", params.address);
    }
    if !params.enabled {
        out.push_str(", disabled");
    }
    if !params.module.is_empty() {
        let _ = write!(out, ", module: '{}'", params.module);
    }
    out.push('\n');
}
