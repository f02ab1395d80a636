//! `*` wildcard patterns for index and snapshot names.

/// Returns true if `pattern` contains a wildcard.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*')
}

/// Matches `name` against `pattern`, where `*` matches any run of
/// characters, including an empty one.
pub fn matches(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return name.is_empty();
    };
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Resolves `patterns` against `names`, keeping the order of `names`.
///
/// Returns the matched names and the non-wildcard patterns that matched
/// nothing. An empty pattern list selects every name.
pub fn resolve<'a>(patterns: &[String], names: impl IntoIterator<Item = &'a str>) -> (Vec<&'a str>, Vec<String>) {
    let names: Vec<&str> = names.into_iter().collect();
    if patterns.is_empty() {
        return (names, Vec::new());
    }
    let missing = patterns
        .iter()
        .filter(|pattern| !is_wildcard(pattern) && !names.contains(&pattern.as_str()))
        .cloned()
        .collect();
    let matched = names
        .into_iter()
        .filter(|name| patterns.iter().any(|pattern| matches(pattern, name)))
        .collect();
    (matched, missing)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("logs", "logs", true)]
    #[test_case("logs", "logs-1", false)]
    #[test_case("logs*", "logs-1", true)]
    #[test_case("*", "", true)]
    #[test_case("*-1", "logs-1", true)]
    #[test_case("l*s*1", "logs-1", true)]
    #[test_case("l*x*1", "logs-1", false)]
    #[test_case("old-version-snapshot-*", "old-version-snapshot-7050099", true)]
    #[test_case("a*a", "a", false)]
    fn wildcard_matching(pattern: &str, name: &str, expected: bool) {
        assert_eq!(matches(pattern, name), expected);
    }

    #[test]
    fn resolve_reports_missing_concrete_names() {
        let patterns = vec!["logs-*".to_string(), "metrics".to_string(), "none-*".to_string()];
        let (matched, missing) = resolve(&patterns, ["logs-1", "logs-2", "traces"]);
        assert_eq!(matched, vec!["logs-1", "logs-2"]);
        assert_eq!(missing, vec!["metrics".to_string()]);
    }

    proptest! {
        /// Property: a pattern without wildcards matches only itself.
        #[test]
        fn prop_literal_matches_itself(name in "[a-z0-9-]{0,12}", other in "[a-z0-9-]{0,12}") {
            prop_assert!(matches(&name, &name));
            prop_assert_eq!(matches(&name, &other), name == other);
        }

        /// Property: a prefix followed by `*` matches every extension.
        #[test]
        fn prop_prefix_wildcard(prefix in "[a-z]{0,6}", suffix in "[a-z0-9]{0,6}") {
            let pattern = format!("{prefix}*");
            let name = format!("{prefix}{suffix}");
            prop_assert!(matches(&pattern, &name));
        }
    }
}
