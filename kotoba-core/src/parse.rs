//! パース関連のユーティリティ関数

use crate::{EvalError, Result};

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use kotoba_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| {
            EvalError::InvalidArgument(format!("Invalid hexadecimal address '{}': {}", s, e))
        })
    } else {
        // 10進数でもダメなら16進数として解釈を試みる
        s.parse::<u64>()
            .or_else(|_| u64::from_str_radix(s, 16))
            .map_err(|e| EvalError::InvalidArgument(format!("Invalid address '{}': {}", s, e)))
    }
}

/// レジスタに書き込む値をパース
///
/// `0x` 付きの16進数、10進数、負の10進数（2の補数）を受け付けます。
pub fn parse_value(s: &str) -> Result<u128> {
    let s = s.trim();
    let invalid = |e: std::num::ParseIntError| {
        EvalError::InvalidArgument(format!("Invalid value '{}': {}", s, e))
    };

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u128::from_str_radix(hex, 16).map_err(invalid)
    } else if s.starts_with('-') {
        s.parse::<i64>().map(|v| v as u64 as u128).map_err(invalid)
    } else {
        s.parse::<u128>().map_err(invalid)
    }
}
