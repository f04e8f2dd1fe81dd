//! Normalization of day-keyed maps.
//!
//! Older builds formatted date keys with the user's locale digits, so
//! `timeSpentOnDay` could contain keys like `٢٠٢٠-٠١-٠٥`. All day keys are
//! stored with ASCII digits now.

use serde_json::{Map, Value};
use std::borrow::Cow;

/// Zero code points of the decimal digit blocks older builds produced.
const DIGIT_ZEROS: [u32; 5] = [
    0x0660, // Arabic-Indic
    0x06F0, // Extended Arabic-Indic
    0x0966, // Devanagari
    0x09E6, // Bengali
    0xFF10, // Fullwidth
];

fn western_digit(c: char) -> Option<char> {
    let cp = c as u32;
    DIGIT_ZEROS
        .iter()
        .find(|zero| (**zero..**zero + 10).contains(&cp))
        .and_then(|zero| char::from_digit(cp - zero, 10))
}

/// Converts every non-ASCII decimal digit in `s` to its ASCII counterpart.
pub fn to_western_digits(s: &str) -> Cow<'_, str> {
    if s.is_ascii() {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().map(|c| western_digit(c).unwrap_or(c)).collect())
}

/// Rewrites the keys of the day map at `obj[field]`. When a converted key
/// already exists, the existing value wins; values are never combined, so the
/// conversion can run any number of times.
pub fn normalize_day_keys(obj: &mut Map<String, Value>, field: &str) -> bool {
    let Some(Value::Object(days)) = obj.get_mut(field) else {
        return false;
    };
    if days.keys().all(|k| k.is_ascii()) {
        return false;
    }
    let old = std::mem::take(days);
    let mut converted = Map::with_capacity(old.len());
    let mut foreign = Vec::new();
    for (key, value) in old {
        if key.is_ascii() {
            converted.insert(key, value);
        } else {
            foreign.push((key, value));
        }
    }
    for (key, value) in foreign {
        let key = to_western_digits(&key).into_owned();
        converted.entry(key).or_insert(value);
    }
    *days = converted;
    true
}
