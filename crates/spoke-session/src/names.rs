//! Display-name rules.
//!
//! Every node on the fabric has a distinct display name. When a newcomer
//! asks for a name that is already in use (compared case-insensitively),
//! the server appends ` (n)` with the smallest free `n`:
//!
//! ```text
//! "bob" → "bob"  → "bob (1)" → "bob (2)"
//! ```
//!
//! [`real_name`] undoes that, which is what moderation keys on: muting
//! "bob" also mutes "bob (1)".

/// Longest accepted display name, in characters.
pub const MAX_NAME_CHARS: usize = 50;

/// Shortest accepted display name; shorter names are padded.
pub const MIN_NAME_CHARS: usize = 2;

/// Normalizes `requested` and makes it unique.
///
/// `is_taken` is asked about candidate names and should compare
/// case-insensitively against every name in use.
pub fn unique_name(requested: &str, mut is_taken: impl FnMut(&str) -> bool) -> String {
    let mut base: String = requested.chars().take(MAX_NAME_CHARS).collect();
    if base.chars().count() < MIN_NAME_CHARS {
        base = format!("aa{base}");
    }

    if !is_taken(&base) {
        return base;
    }
    (1..)
        .map(|n| format!("{base} ({n})"))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or(base)
}

/// Strips a trailing ` (n)` uniqueness suffix.
pub fn real_name(name: &str) -> &str {
    let Some(open) = name.rfind(" (") else {
        return name;
    };
    let suffix = &name[open + 2..];
    match suffix.strip_suffix(')') {
        Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            &name[..open]
        }
        _ => name,
    }
}

/// Case-insensitive name comparison used for uniqueness.
pub fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taken<'a>(names: &'a [&'a str]) -> impl FnMut(&str) -> bool + 'a {
        move |candidate| names.iter().any(|n| same_name(n, candidate))
    }

    #[test]
    fn test_free_name_is_kept() {
        assert_eq!(unique_name("alice", taken(&["bob"])), "alice");
    }

    #[test]
    fn test_collision_appends_smallest_free_suffix() {
        assert_eq!(unique_name("bob", taken(&["bob"])), "bob (1)");
        assert_eq!(unique_name("bob", taken(&["bob", "bob (1)"])), "bob (2)");
        assert_eq!(unique_name("bob", taken(&["bob", "bob (2)"])), "bob (1)");
    }

    #[test]
    fn test_collision_is_case_insensitive() {
        assert_eq!(unique_name("BOB", taken(&["bob"])), "BOB (1)");
    }

    #[test]
    fn test_short_names_are_padded() {
        assert_eq!(unique_name("x", taken(&[])), "aax");
        assert_eq!(unique_name("", taken(&[])), "aa");
    }

    #[test]
    fn test_long_names_are_truncated() {
        let long = "n".repeat(80);
        assert_eq!(unique_name(&long, taken(&[])).chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long = "é".repeat(60);
        let name = unique_name(&long, taken(&[]));
        assert_eq!(name.chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn test_real_name_strips_suffix() {
        assert_eq!(real_name("bob (1)"), "bob");
        assert_eq!(real_name("bob (12)"), "bob");
        assert_eq!(real_name("bob"), "bob");
        assert_eq!(real_name("bob (x)"), "bob (x)");
        assert_eq!(real_name("bob ()"), "bob ()");
    }
}
