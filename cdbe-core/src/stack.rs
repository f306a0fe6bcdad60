//! スタックトレースの解析
//!
//! フレームのソースパスを手元のパスに変換し、表示するフレームを決めます。
//! ソース単位のステップインでソースのないフレームに入った場合は、
//! 追加のステップかステップアウトを要求します。

use crate::session::Wow64State;
use cdbe_mi::{clean_path, map_source_path, parse_frames, to_native_separators, uppercase_drive_letter};
use cdbe_mi::{Frame, MappingDirection, MiValue, SourcePathMapping};
use std::collections::HashMap;
use std::path::Path;

/// 正規化したソースファイル名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSourceFile {
    pub file_name: String,
    pub exists: bool,
}

/// ソースパスの正規化結果のキャッシュ
///
/// キーはデバッガが報告したそのままのパス。
pub struct SourcePathCache {
    cache: HashMap<String, NormalizedSourceFile>,
    exists: Box<dyn Fn(&str) -> bool>,
}

impl SourcePathCache {
    pub fn new() -> Self {
        Self::with_probe(|path| Path::new(path).is_file())
    }

    /// ファイルの存在確認を差し替える
    pub fn with_probe(probe: impl Fn(&str) -> bool + 'static) -> Self {
        Self {
            cache: HashMap::new(),
            exists: Box::new(probe),
        }
    }

    pub fn normalize(&mut self, raw: &str, mappings: &[SourcePathMapping]) -> NormalizedSourceFile {
        if let Some(hit) = self.cache.get(raw) {
            return hit.clone();
        }
        let mapped = map_source_path(&to_native_separators(raw), mappings, MappingDirection::DebuggerToSource);
        let cleaned = clean_path(&mapped);
        let exists = !cleaned.is_empty() && (self.exists)(&cleaned);
        let result = NormalizedSourceFile {
            file_name: if exists { cleaned } else { uppercase_drive_letter(&cleaned) },
            exists,
        };
        self.cache.insert(raw.to_string(), result.clone());
        result
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for SourcePathCache {
    fn default() -> Self {
        Self::new()
    }
}

/// 解析結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackParse {
    Frames {
        frames: Vec<Frame>,
        incomplete: bool,
        current: Option<usize>,
    },
    /// 先に WOW64 の判定が必要
    NeedWow64,
    /// ジャンプテーブル（`ILT+`）に止まったのでもう1回ステップインする
    StepInto,
    /// ソースのないフレームに入ったのでステップアウトする
    StepOut,
}

/// スタックを解析する
pub fn parse_stack_trace(
    data: &MiValue,
    wow64: Wow64State,
    source_step_into: bool,
    mappings: &[SourcePathMapping],
    cache: &mut SourcePathCache,
) -> StackParse {
    let (mut frames, incomplete) = parse_frames(data);
    let mut current = None;
    for (i, frame) in frames.iter_mut().enumerate() {
        if wow64 == Wow64State::Uninitialized {
            return StackParse::NeedWow64;
        }
        let Some(file) = frame.file.clone().filter(|f| !f.is_empty()) else {
            if i == 0 && source_step_into {
                if frame.function.contains("ILT+") {
                    return StackParse::StepInto;
                }
                return StackParse::StepOut;
            }
            continue;
        };
        let normalized = cache.normalize(&file, mappings);
        if !normalized.exists && i == 0 && source_step_into {
            return StackParse::StepOut;
        }
        frame.file = Some(normalized.file_name);
        frame.usable = normalized.exists;
        if current.is_none() && frame.usable {
            current = Some(i);
        }
    }
    // 使えるフレームがなければ逆アセンブル表示
    if !frames.is_empty() && current.is_none() {
        current = Some(0);
    }
    StackParse::Frames {
        frames,
        incomplete,
        current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdbe_mi::parse;
    use std::cell::Cell;
    use std::rc::Rc;

    const STACK: &str = r#"[frame={level="0",function="ntdll!NtWait",from="ntdll",address="0x10"},frame={level="1",fullname="c:\\src\\main.cpp",line="18",function="app!main",from="app",address="0x20"},frame={level="2",fullname="C:\\src\\crt.cpp",line="5",function="app!start",address="0x30"}]"#;

    fn existing(paths: &'static [&'static str]) -> SourcePathCache {
        SourcePathCache::with_probe(move |p| paths.iter().any(|x| x.eq_ignore_ascii_case(p)))
    }

    #[test]
    fn test_first_usable_frame_is_current() {
        let data = parse(STACK).unwrap();
        let mut cache = existing(&["c:\\src\\main.cpp"]);
        match parse_stack_trace(&data, Wow64State::NoWow64, false, &[], &mut cache) {
            StackParse::Frames { frames, incomplete, current } => {
                assert!(!incomplete);
                assert_eq!(frames.len(), 3);
                assert_eq!(current, Some(1));
                assert!(frames[1].usable);
                assert!(!frames[2].usable);
                assert_eq!(frames[1].file.as_deref(), Some("c:\\src\\main.cpp"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_usable_frame_falls_back_to_top() {
        let data = parse(STACK).unwrap();
        let mut cache = existing(&[]);
        match parse_stack_trace(&data, Wow64State::Native64Stack, false, &[], &mut cache) {
            StackParse::Frames { frames, current, .. } => {
                assert_eq!(current, Some(0));
                assert_eq!(frames[1].file.as_deref(), Some("C:\\src\\main.cpp"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_uninitialized_wow64_requests_detection() {
        let data = parse(STACK).unwrap();
        let mut cache = existing(&[]);
        assert_eq!(
            parse_stack_trace(&data, Wow64State::Uninitialized, false, &[], &mut cache),
            StackParse::NeedWow64
        );
        let empty = parse("[]").unwrap();
        assert!(matches!(
            parse_stack_trace(&empty, Wow64State::Uninitialized, false, &[], &mut cache),
            StackParse::Frames { current: None, .. }
        ));
    }

    #[test]
    fn test_step_into_thunk_and_no_source() {
        let thunk = parse(r#"[frame={function="app!ILT+1234(foo)",address="0x10"}]"#).unwrap();
        let mut cache = existing(&[]);
        assert_eq!(
            parse_stack_trace(&thunk, Wow64State::NoWow64, true, &[], &mut cache),
            StackParse::StepInto
        );
        let data = parse(STACK).unwrap();
        assert_eq!(
            parse_stack_trace(&data, Wow64State::NoWow64, true, &[], &mut cache),
            StackParse::StepOut
        );
        let missing = parse(r#"[frame={fullname="C:\\gone.cpp",line="1",function="f"}]"#).unwrap();
        assert_eq!(
            parse_stack_trace(&missing, Wow64State::NoWow64, true, &[], &mut cache),
            StackParse::StepOut
        );
    }

    #[test]
    fn test_path_mapping_and_cache() {
        let probes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&probes);
        let mut cache = SourcePathCache::with_probe(move |p| {
            counter.set(counter.get() + 1);
            p == "D:\\work\\main.cpp"
        });
        let mappings = vec![SourcePathMapping::new("D:\\work", "C:\\build")];
        let first = cache.normalize("C:/build/./main.cpp", &mappings);
        assert_eq!(
            first,
            NormalizedSourceFile {
                file_name: "D:\\work\\main.cpp".to_string(),
                exists: true,
            }
        );
        assert_eq!(cache.normalize("C:/build/./main.cpp", &mappings), first);
        assert_eq!(probes.get(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
