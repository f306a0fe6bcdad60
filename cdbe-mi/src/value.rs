//! GDBMI 形式の値ツリー
//!
//! 拡張ライブラリや CDB の応答を表す再帰的な名前付きノードです。
//! 子要素の検索は `Option` を返し、「存在しないフィールド」と
//! 「空文字列のフィールド」を区別します。

use std::fmt;

/// ノードの中身
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiData {
    /// スカラー値
    Scalar(String),
    /// `{...}` で囲まれた子要素
    Tuple(Vec<MiValue>),
    /// `[...]` で囲まれた子要素
    List(Vec<MiValue>),
}

/// 名前付きノード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiValue {
    /// ノード名（無名の場合は空）
    pub name: String,
    /// ノードの中身
    pub data: MiData,
}

impl MiValue {
    /// スカラーノードを作成する
    pub fn scalar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: MiData::Scalar(value.into()),
        }
    }

    /// タプルノードを作成する
    pub fn tuple(name: impl Into<String>, children: Vec<MiValue>) -> Self {
        Self {
            name: name.into(),
            data: MiData::Tuple(children),
        }
    }

    /// リストノードを作成する
    pub fn list(name: impl Into<String>, children: Vec<MiValue>) -> Self {
        Self {
            name: name.into(),
            data: MiData::List(children),
        }
    }

    /// ノード名を取得する
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 名前を付け替えたノードを返す
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.data, MiData::Scalar(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self.data, MiData::Tuple(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self.data, MiData::List(_))
    }

    /// スカラー値を取得する
    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            MiData::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// スカラー値を取得する（スカラーでなければ空文字列）
    pub fn data(&self) -> &str {
        self.as_str().unwrap_or("")
    }

    /// 子要素を取得する（スカラーなら空）
    pub fn children(&self) -> &[MiValue] {
        match &self.data {
            MiData::Tuple(c) | MiData::List(c) => c,
            MiData::Scalar(_) => &[],
        }
    }

    /// 子要素を末尾に追加する
    ///
    /// スカラーノードに追加した場合はタプルに変換されます。
    pub fn push(&mut self, child: MiValue) {
        match &mut self.data {
            MiData::Tuple(c) | MiData::List(c) => c.push(child),
            MiData::Scalar(_) => self.data = MiData::Tuple(vec![child]),
        }
    }

    /// 名前で子要素を検索する
    pub fn get(&self, name: &str) -> Option<&MiValue> {
        self.children().iter().find(|c| c.name == name)
    }

    /// 子要素のスカラー値を取得する
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(MiValue::as_str)
    }

    /// 子要素のスカラー値を取得する（空文字列は存在しないものとみなす）
    ///
    /// 識別子系のフィールド（`reason`, `id` など）はこちらで参照する。
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.str(name).filter(|s| !s.is_empty())
    }

    /// スカラー値を整数として解釈する（`0x` 接頭辞は16進数）
    pub fn to_i64(&self) -> Option<i64> {
        let s = self.as_str()?.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }

    /// スカラー値を符号なし整数として解釈する（`0x` 接頭辞は16進数）
    pub fn to_u64(&self) -> Option<u64> {
        let s = self.as_str()?.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }

    /// 子要素のイテレータ
    pub fn iter(&self) -> std::slice::Iter<'_, MiValue> {
        self.children().iter()
    }
}

impl<'a> IntoIterator for &'a MiValue {
    type Item = &'a MiValue;
    type IntoIter = std::slice::Iter<'a, MiValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// C 文字列としてエスケープする
pub fn escape_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for MiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            write!(f, "{}=", self.name)?;
        }
        match &self.data {
            MiData::Scalar(s) => write!(f, "\"{}\"", escape_c_string(s)),
            MiData::Tuple(children) | MiData::List(children) => {
                let (open, close) = if self.is_list() { ('[', ']') } else { ('{', '}') };
                write!(f, "{}", open)?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, "{}", close)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_and_empty_fields_are_distinct() {
        let v = MiValue::tuple(
            "",
            vec![MiValue::scalar("reason", ""), MiValue::scalar("threadId", "3")],
        );
        assert_eq!(v.str("reason"), Some(""));
        assert_eq!(v.non_empty("reason"), None);
        assert_eq!(v.str("missing"), None);
        assert_eq!(v.get("threadId").and_then(MiValue::to_i64), Some(3));
    }

    #[test]
    fn test_display() {
        let v = MiValue::tuple(
            "",
            vec![
                MiValue::scalar("a", "x\"y"),
                MiValue::list("l", vec![MiValue::scalar("", "1")]),
            ],
        );
        assert_eq!(v.to_string(), r#"{a="x\"y",l=["1"]}"#);
    }
}
