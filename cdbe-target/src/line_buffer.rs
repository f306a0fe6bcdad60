//! バイト列を行に分割するバッファ

/// 受信したバイト列を `\n` で区切る
///
/// 行末の `\r` は取り除き、改行で終わっていない部分は次の入力まで保持する。
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// バイト列を追加し、完成した行を返す
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// 改行で終わっていない残りを取り出す（プロセス終了時）
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.pending);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// 保持中のバイト数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_lines_are_retained() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"0:000> ab").is_empty());
        assert_eq!(buffer.pending_len(), 9);
        assert_eq!(buffer.push(b"c\r\ndef\n\r\ngh"), vec!["0:000> abc", "def", ""]);
        assert_eq!(buffer.flush().as_deref(), Some("gh"));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"line\r").is_empty());
        assert_eq!(buffer.push(b"\n"), vec!["line"]);
    }
}
