//! 16進数エンコーディングのユーティリティ

/// 16進文字列をバイト列にデコードする
///
/// 奇数長や16進数以外の文字を含む場合は `None` を返す。
pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

/// バイト列を小文字の16進文字列にエンコードする
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 16進エンコードされた UTF-16LE 文字列をデコードする
///
/// 拡張ライブラリがデバッグ対象の出力（OutputDebugString など）を
/// 送ってくる形式。不正な部分は置換文字になる。
pub fn decode_utf16_hex(s: &str) -> String {
    let bytes = decode_hex(s).unwrap_or_default();
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// CDB 形式のアドレス（`00000001`3f7ebe80` や `0x1234`）を解釈する
pub fn parse_cdb_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    let cleaned: String = s.chars().filter(|c| *c != '`').collect();
    if cleaned.is_empty() {
        return None;
    }
    u64::from_str_radix(&cleaned, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_hex("0"), None);
        assert_eq!(decode_hex("zz"), None);
        assert_eq!(encode_hex(&[0xde, 0xad]), "dead");
    }

    #[test]
    fn test_decode_utf16_hex() {
        // "Hi\n" in UTF-16LE
        assert_eq!(decode_utf16_hex("480069000a00"), "Hi\n");
    }

    #[test]
    fn test_parse_cdb_hex() {
        assert_eq!(parse_cdb_hex("00000001`3f7ebe80"), Some(0x1_3f7e_be80));
        assert_eq!(parse_cdb_hex("0x10"), Some(0x10));
        assert_eq!(parse_cdb_hex("`"), None);
    }
}
