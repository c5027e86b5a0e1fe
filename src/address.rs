//! Phone address normalization.
//!
//! Every counterpart address is stored and matched in one canonical form so
//! that bulk rows, webhook payloads, and dashboard requests all land on the
//! same conversation regardless of how the number was written.

use std::sync::OnceLock;

use regex::Regex;

/// Fixed country-code prefix applied to canonical addresses.
pub const COUNTRY_PREFIX: &str = "+91";

fn non_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\D").expect("static regex"))
}

/// Strip everything but digits from a raw address string.
pub fn digits_only(raw: &str) -> String {
    non_digits().replace_all(raw.trim(), "").into_owned()
}

/// Normalize a raw phone string to `+91XXXXXXXXXX` where possible.
///
/// Accepts `+91...`, `91...`, `0...`, plain 10-digit, and any separator
/// noise. Inputs that don't resolve to 10 significant digits are returned
/// unchanged so the failure is visible downstream instead of silently
/// mangled.
pub fn canonical_address(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let mut digits = digits_only(raw);
    if digits.starts_with("91") && digits.len() >= 12 {
        digits = digits[2..].to_string();
    } else if digits.starts_with('0') && digits.len() == 11 {
        digits = digits[1..].to_string();
    }
    if digits.len() >= 10 {
        digits = digits[digits.len() - 10..].to_string();
    }
    if digits.len() == 10 {
        format!("{COUNTRY_PREFIX}{digits}")
    } else {
        raw.trim().to_string()
    }
}

/// Digits-only group name for a conversation address.
///
/// Example: `"+91 63026-61004"` -> `"916302661004"`.
pub fn conversation_group(address: &str) -> String {
    digits_only(address)
}
