//! Small helpers shared across the request pipeline.

use serde_json::Value;

/// A JSON dump prepared for logging, possibly shortened around the middle.
#[derive(Debug, Clone)]
pub struct DumpCut {
    pub text: String,
    pub truncated: bool,
}

/// Serializes `value` for logging, keeping at most `max_length` characters.
///
/// Oversized dumps keep the head and tail joined by an ellipsis so that both
/// the method list and trailing ids stay visible in log lines.
#[must_use]
pub fn dumpcut(value: &Value, max_length: usize) -> DumpCut {
    const CUT_SEP: &str = "…";
    let text = value.to_string();
    if text.chars().count() <= max_length {
        return DumpCut {
            text,
            truncated: false,
        };
    }

    let half_len = max_length / 2;
    let right_len = half_len.saturating_sub(CUT_SEP.chars().count()).max(1);
    let head: String = text.chars().take(half_len).collect();
    let tail_start = text.chars().count() - right_len;
    let tail: String = text.chars().skip(tail_start).collect();
    DumpCut {
        text: format!("{head}{CUT_SEP}{tail}"),
        truncated: true,
    }
}

/// Parses a JSON-RPC hex quantity, with or without the `0x` prefix.
#[must_use]
pub fn parse_hex_u128(text: &str) -> Option<u128> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}

#[must_use]
pub fn parse_hex_u64(text: &str) -> Option<u64> {
    parse_hex_u128(text).and_then(|value| u64::try_from(value).ok())
}

/// Formats a quantity the way JSON-RPC expects it (`0x`-prefixed, no
/// leading zeroes).
#[must_use]
pub fn to_hex(value: u128) -> String {
    format!("{value:#x}")
}

/// Splits `items` into the ones failing `is_special` (in order) and the
/// special ones paired with their original positions.
pub fn pick_out_special_items<T>(
    items: Vec<T>,
    is_special: impl Fn(&T) -> bool,
) -> (Vec<T>, Vec<(usize, T)>) {
    let mut normal_items = Vec::new();
    let mut special_items = Vec::new();
    for (idx, item) in items.into_iter().enumerate() {
        if is_special(&item) {
            special_items.push((idx, item));
        } else {
            normal_items.push(item);
        }
    }
    (normal_items, special_items)
}

/// Inverse of [`pick_out_special_items`]: reinserts the special results at
/// their original positions.
#[must_use]
pub fn put_in_special_results<T>(
    normal_results: Vec<T>,
    special_results: Vec<(usize, T)>,
) -> Vec<T> {
    let mut result = normal_results;
    for (idx, item) in special_results {
        let idx = idx.min(result.len());
        result.insert(idx, item);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dumpcut_short_value_kept_whole() {
        let dump = dumpcut(&json!({"value": "short"}), 40);
        assert!(!dump.truncated);
        assert_eq!(dump.text, r#"{"value":"short"}"#);
    }

    #[test]
    fn test_dumpcut_long_value_shortened() {
        let dump = dumpcut(&json!({"value": "long".repeat(10)}), 20);
        assert!(dump.truncated);
        assert!(dump.text.chars().count() <= 20);
        assert!(dump.text.contains('…'));
        assert!(dump.text.starts_with(r#"{"value":""#));
        assert!(dump.text.ends_with(r#"onglong"}"#));
    }

    #[test]
    fn test_pick_out_and_put_in_round_trip() {
        let items = vec!["aa", "xbb", "cc", "xdd"];
        let (normal, special) = pick_out_special_items(items, |item| item.starts_with('x'));
        assert_eq!(normal, vec!["aa", "cc"]);
        assert_eq!(special, vec![(1, "xbb"), (3, "xdd")]);

        let restored = put_in_special_results(normal, special);
        assert_eq!(restored, vec!["aa", "xbb", "cc", "xdd"]);
    }

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(parse_hex_u128("0x1771"), Some(0x1771));
        assert_eq!(parse_hex_u128("1771"), Some(0x1771));
        assert_eq!(parse_hex_u128("0x"), None);
        assert_eq!(parse_hex_u128("0xzz"), None);
        assert_eq!(to_hex(0x1771), "0x1771");
        assert_eq!(parse_hex_u64(&to_hex(3000)), Some(3000));
    }

    #[test]
    fn test_put_in_all_special() {
        let (normal, special) = pick_out_special_items(vec![1, 2], |_| true);
        assert!(normal.is_empty());
        let restored = put_in_special_results(normal, special);
        assert_eq!(restored, vec![1, 2]);
    }
}
