//! Normalization of legacy correct-answer values.
//!
//! Older question imports stored the correct answer directly on the question
//! in several shapes. They are reduced to a single `LegacyAnswer` here so the
//! domain never has to inspect raw shapes.

use exam_core::model::{LegacyAnswer, OptionId};
use serde_json::Value;

/// Parse a stored legacy answer.
///
/// Accepts JSON (number, string, single-element array, `{"answer": ..}`,
/// `{"correct": ..}` or `{"option_id": n}`) and falls back to treating the raw
/// text as an option letter, index or option text. Returns `None` for empty or
/// ambiguous values.
#[must_use]
pub fn parse_legacy_answer(raw: &str) -> Option<LegacyAnswer> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => from_value(&value),
        Err(_) => from_text(trimmed),
    }
}

fn from_value(value: &Value) -> Option<LegacyAnswer> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .map(LegacyAnswer::Index),
        Value::String(s) => from_text(s.trim()),
        Value::Array(items) if items.len() == 1 => from_value(&items[0]),
        Value::Object(map) => {
            if let Some(id) = map.get("option_id").and_then(Value::as_u64) {
                return Some(LegacyAnswer::OptionId(OptionId::new(id)));
            }
            map.get("answer")
                .or_else(|| map.get("correct"))
                .and_then(from_value)
        }
        _ => None,
    }
}

fn from_text(text: &str) -> Option<LegacyAnswer> {
    if text.is_empty() {
        return None;
    }
    if let Ok(index) = text.parse::<usize>() {
        return Some(LegacyAnswer::Index(index));
    }
    let mut chars = text.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_alphabetic() {
            let offset = c.to_ascii_uppercase() as u8 - b'A';
            return Some(LegacyAnswer::Index(usize::from(offset)));
        }
    }
    Some(LegacyAnswer::Text(text.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_letters_are_indexes() {
        assert_eq!(parse_legacy_answer("2"), Some(LegacyAnswer::Index(2)));
        assert_eq!(parse_legacy_answer("\"1\""), Some(LegacyAnswer::Index(1)));
        assert_eq!(parse_legacy_answer("C"), Some(LegacyAnswer::Index(2)));
        assert_eq!(parse_legacy_answer("\"b\""), Some(LegacyAnswer::Index(1)));
    }

    #[test]
    fn wrapped_shapes_are_unwrapped() {
        assert_eq!(parse_legacy_answer("[3]"), Some(LegacyAnswer::Index(3)));
        assert_eq!(
            parse_legacy_answer(r#"{"answer": "Paris"}"#),
            Some(LegacyAnswer::Text("Paris".into()))
        );
        assert_eq!(
            parse_legacy_answer(r#"{"option_id": 42}"#),
            Some(LegacyAnswer::OptionId(OptionId::new(42)))
        );
    }

    #[test]
    fn plain_text_falls_back_to_option_text() {
        assert_eq!(
            parse_legacy_answer("  Photosynthesis "),
            Some(LegacyAnswer::Text("Photosynthesis".into()))
        );
    }

    #[test]
    fn empty_and_ambiguous_values_are_rejected() {
        assert_eq!(parse_legacy_answer("   "), None);
        assert_eq!(parse_legacy_answer("[1, 2]"), None);
        assert_eq!(parse_legacy_answer("null"), None);
        assert_eq!(parse_legacy_answer("-1"), None);
    }
}
