//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）、CDB 形式（`00000001`3f7ebe80`）、10進数をサポート
///
/// # Examples
/// ```
/// use cdbe_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("00000001`00001000").unwrap(), 0x1_0000_1000);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let hex: String = hex.chars().filter(|c| *c != '`').collect();
        u64::from_str_radix(&hex, 16).map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else if s.contains('`') {
        let hex: String = s.chars().filter(|c| *c != '`').collect();
        u64::from_str_radix(&hex, 16).map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    } else {
        // 10進数でもダメなら16進数として解釈を試みる
        s.parse::<u64>()
            .or_else(|_| u64::from_str_radix(s, 16))
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// `?` コマンドの応答からアドレスを取り出す
///
/// ```text
/// Evaluate expression: 5368713213 = 00000001`3fcf357d
/// ```
pub fn parse_evaluated_address(reply: &str) -> Option<u64> {
    let (_, value) = reply.split_once(" = ")?;
    let value: String = value.trim().chars().filter(|c| *c != '`').collect();
    u64::from_str_radix(&value, 16).ok()
}

/// `file:line` を分割する（ドライブ文字の `:` は区切りとみなさない）
pub fn split_file_line(s: &str) -> Option<(&str, u32)> {
    let (file, line) = s.rsplit_once(':')?;
    if file.is_empty() {
        return None;
    }
    line.trim().parse().ok().map(|line| (file, line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0xabcd").unwrap(), 0xabcd);
        assert_eq!(parse_address("0x00000001`3f7ebe80").unwrap(), 0x1_3f7e_be80);
    }

    #[test]
    fn test_parse_address_dec() {
        assert_eq!(parse_address("1234").unwrap(), 1234);
        assert_eq!(parse_address("9999").unwrap(), 9999);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
    }

    #[test]
    fn test_parse_evaluated_address() {
        assert_eq!(
            parse_evaluated_address("Evaluate expression: 5368713213 = 00000001`3fcf357d"),
            Some(0x1_3fcf_357d)
        );
        assert_eq!(parse_evaluated_address("Couldn't resolve error"), None);
    }

    #[test]
    fn test_split_file_line() {
        assert_eq!(split_file_line("C:\\src\\main.cpp:18"), Some(("C:\\src\\main.cpp", 18)));
        assert_eq!(split_file_line("main.cpp:x"), None);
        assert_eq!(split_file_line("main"), None);
    }
}
