/// Replace any character outside `[A-Za-z0-9._-]` with `_` and collapse
/// consecutive underscores.
pub fn sanitize_filename(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_underscore = false;
    for ch in s.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' || ch == '_' {
            ch
        } else {
            '_'
        };
        if mapped == '_' && last_was_underscore {
            continue;
        }
        last_was_underscore = mapped == '_';
        out.push(mapped);
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Resolve a name collision against `existing` by appending `_1`, `_2`, …
pub fn dedupe_name(base: &str, existing: &[String]) -> String {
    if !existing.iter().any(|e| e == base) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}_{n}");
        if !existing.iter().any(|e| e == &candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("a b/c*d"), "a_b_c_d");
    }

    #[test]
    fn collapses_runs() {
        assert_eq!(sanitize_filename("a   b"), "a_b");
    }

    #[test]
    fn empty_becomes_underscore() {
        assert_eq!(sanitize_filename("***"), "_");
    }

    #[test]
    fn dedupe_appends_suffix() {
        let existing = vec!["x".to_string(), "x_1".to_string()];
        assert_eq!(dedupe_name("x", &existing), "x_2");
    }

    #[test]
    fn dedupe_noop_when_unique() {
        let existing = vec!["y".to_string()];
        assert_eq!(dedupe_name("x", &existing), "x");
    }
}
