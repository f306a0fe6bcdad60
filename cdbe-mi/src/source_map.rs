//! ソースパスのマッピング
//!
//! デバッグ情報に記録されたビルド時のパスと、手元のソースツリーの
//! パスを相互に置き換えます。比較は Windows 流に大文字小文字を区別しません。

/// マッピングの方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingDirection {
    /// デバッガが報告したパスを手元のパスへ
    DebuggerToSource,
    /// 手元のパスをデバッガに渡すパスへ
    SourceToDebugger,
}

/// `(手元のパス, デバッガ側のパス)` の組
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePathMapping {
    pub source: String,
    pub debugger: String,
}

impl SourcePathMapping {
    /// 区切り文字を `\` に揃えて作成する
    pub fn new(source: &str, debugger: &str) -> Self {
        Self {
            source: to_native_separators(source),
            debugger: to_native_separators(debugger),
        }
    }
}

/// `/` を `\` に置き換える
pub fn to_native_separators(path: &str) -> String {
    path.replace('/', "\\")
}

fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

/// 最初に一致したマッピングを適用する
///
/// 接頭辞が大文字小文字を無視して一致し、かつ直後が区切り文字の場合のみ置き換える。
pub fn map_source_path(
    path: &str,
    mappings: &[SourcePathMapping],
    direction: MappingDirection,
) -> String {
    for mapping in mappings {
        let (from, to) = match direction {
            MappingDirection::DebuggerToSource => (&mapping.debugger, &mapping.source),
            MappingDirection::SourceToDebugger => (&mapping.source, &mapping.debugger),
        };
        if from.is_empty() || path.len() <= from.len() || !path.is_char_boundary(from.len()) {
            continue;
        }
        let (head, tail) = path.split_at(from.len());
        if head.eq_ignore_ascii_case(from) && tail.starts_with(is_separator) {
            let mut mapped = to.clone();
            mapped.push_str(tail);
            return mapped;
        }
    }
    path.to_string()
}

/// `a\.\b\..\c` のような冗長な要素を取り除く
pub fn clean_path(path: &str) -> String {
    let native = to_native_separators(path);
    let unc = native.starts_with("\\\\");
    let rooted = native.starts_with('\\');
    let mut parts: Vec<&str> = Vec::new();
    for part in native.split('\\') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(p) if *p != ".." && !p.ends_with(':')) {
                    parts.pop();
                } else if !rooted {
                    parts.push(part);
                }
            }
            _ => parts.push(part),
        }
    }
    let prefix = if unc {
        "\\\\"
    } else if rooted {
        "\\"
    } else {
        ""
    };
    format!("{}{}", prefix, parts.join("\\"))
}

/// `c:\foo` のドライブ文字を大文字にする
pub fn uppercase_drive_letter(path: &str) -> String {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if path.len() > 2 && drive.is_ascii_alphabetic() => {
            format!("{}{}", drive.to_ascii_uppercase(), &path[1..])
        }
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> Vec<SourcePathMapping> {
        vec![SourcePathMapping::new("D:/work/app", "C:\\build\\app")]
    }

    #[test]
    fn test_map_both_directions() {
        assert_eq!(
            map_source_path("c:\\BUILD\\app\\main.cpp", &mappings(), MappingDirection::DebuggerToSource),
            "D:\\work\\app\\main.cpp"
        );
        assert_eq!(
            map_source_path("D:\\work\\app\\main.cpp", &mappings(), MappingDirection::SourceToDebugger),
            "C:\\build\\app\\main.cpp"
        );
    }

    #[test]
    fn test_prefix_must_end_at_separator() {
        assert_eq!(
            map_source_path("C:\\build\\application\\x.cpp", &mappings(), MappingDirection::DebuggerToSource),
            "C:\\build\\application\\x.cpp"
        );
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("C:/a/./b/../c.cpp"), "C:\\a\\c.cpp");
        assert_eq!(clean_path("\\\\server\\share\\x"), "\\\\server\\share\\x");
    }

    #[test]
    fn test_uppercase_drive_letter() {
        assert_eq!(uppercase_drive_letter("c:\\x.cpp"), "C:\\x.cpp");
        assert_eq!(uppercase_drive_letter("x.cpp"), "x.cpp");
    }
}
