#![forbid(unsafe_code)]

use regex::Regex;
use time::Date;
use time::macros::format_description;

use crate::error::AgentqError;

const SLUG_MAX_LEN: usize = 50;

const TYPE_KEYWORDS: &[(&str, &[&str])] = &[
    ("fix", &["fix", "bug", "error", "crash", "broken", "issue"]),
    ("feature", &["feat", "feature", "add", "implement", "create", "new"]),
    ("refactor", &["refactor", "restructure", "reorganize", "clean"]),
    ("docs", &["doc", "docs", "document", "readme"]),
    ("test", &["test", "spec", "coverage"]),
    ("chore", &["chore", "update", "upgrade", "bump", "deps"]),
    ("perf", &["perf", "performance", "optimize", "speed"]),
];

/// Lowercase, collapse runs of non-alphanumerics into `-`, and cut at a word
/// boundary when longer than `max_len`.
#[must_use]
pub fn slugify(text: &str, max_len: usize) -> String {
    let lower = text.to_lowercase();
    let mut slug = String::with_capacity(lower.len());
    let mut pending_dash = false;
    for c in lower.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.len() > max_len {
        slug.truncate(max_len);
        if let Some(cut) = slug.rfind('-') {
            slug.truncate(cut);
        }
    }
    slug
}

#[must_use]
pub fn task_slug_base(prompt: &str, date: Date) -> String {
    let fmt = format_description!("[year][month][day]");
    let prefix = date.format(fmt).unwrap_or_else(|_| "00000000".to_owned());
    let slug = slugify(prompt, SLUG_MAX_LEN);
    if slug.is_empty() {
        format!("{prefix}-task")
    } else {
        format!("{prefix}-{slug}")
    }
}

/// First of `base`, `base-2`, `base-3`, ... that `taken` rejects.
pub fn unique_slug<F>(base: &str, mut taken: F) -> Result<String, AgentqError>
where
    F: FnMut(&str) -> Result<bool, AgentqError>,
{
    if !taken(base)? {
        return Ok(base.to_owned());
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !taken(&candidate)? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

#[must_use]
pub fn infer_type_from_prompt(prompt: &str) -> Option<&'static str> {
    let lower = prompt.to_lowercase();
    TYPE_KEYWORDS.iter().find_map(|(name, words)| {
        words
            .iter()
            .any(|w| contains_word(&lower, w))
            .then_some(*name)
    })
}

fn contains_word(haystack: &str, word: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(word)))
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

/// Rejects patterns that can never render to a valid git ref.
pub fn validate_branch_pattern(pattern: &str) -> Result<(), AgentqError> {
    let bad = |msg: &str| Err(AgentqError::Config(format!("branch pattern '{pattern}' {msg}")));
    if pattern.trim().is_empty() {
        return bad("is empty");
    }
    if let Some(c) = pattern
        .chars()
        .find(|c| matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return bad(&format!("contains invalid character '{c}'"));
    }
    if pattern.contains("..") {
        return bad("contains '..'");
    }
    if pattern.contains("//") {
        return bad("contains '//'");
    }
    if pattern.starts_with('.') || pattern.starts_with('/') {
        return bad("must not start with '.' or '/'");
    }
    if pattern.ends_with('/') || pattern.ends_with(".lock") {
        return bad("must not end with '/' or '.lock'");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct BranchVars<'a> {
    pub project: &'a str,
    pub task_slug: &'a str,
    pub prompt: &'a str,
    pub explicit_type: Option<&'a str>,
    pub default_type: &'a str,
}

/// Substitutes `{project}`, `{task_id}`, `{date}`, `{slug}` and `{type}`.
#[must_use]
pub fn render_branch_name(pattern: &str, vars: &BranchVars<'_>) -> String {
    let branch_type = vars
        .explicit_type
        .or_else(|| infer_type_from_prompt(vars.prompt))
        .unwrap_or(vars.default_type);
    let (date, slug) = vars
        .task_slug
        .split_once('-')
        .unwrap_or(("", vars.task_slug));

    pattern
        .replace("{project}", vars.project)
        .replace("{task_id}", vars.task_slug)
        .replace("{date}", date)
        .replace("{slug}", slug)
        .replace("{type}", branch_type)
}

#[must_use]
pub fn sanitize_for_filesystem(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '/'
            || c == '\\'
            || c.is_control()
            || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|')
        {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    #[test]
    fn slugify_collapses_and_truncates_on_word_boundary() {
        assert_eq!(slugify("Fix the  Login bug!", 50), "fix-the-login-bug");
        assert_eq!(slugify("--Hello__World--", 50), "hello-world");
        let long = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda";
        let s = slugify(long, 50);
        assert!(s.len() <= 50);
        assert!(!s.ends_with('-'));
        assert!(long.replace(' ', "-").starts_with(&s));
    }

    #[test]
    fn task_slug_uses_date_prefix_and_suffixes_collisions() {
        let date = Date::from_calendar_date(2025, Month::March, 7).unwrap();
        let base = task_slug_base("Add retry logic", date);
        assert_eq!(base, "20250307-add-retry-logic");
        assert_eq!(task_slug_base("!!!", date), "20250307-task");

        let taken = ["20250307-add-retry-logic", "20250307-add-retry-logic-2"];
        let unique = unique_slug(&base, |s| Ok(taken.contains(&s))).unwrap();
        assert_eq!(unique, "20250307-add-retry-logic-3");
    }

    #[test]
    fn infers_branch_type_by_whole_word() {
        assert_eq!(infer_type_from_prompt("Fix crash on startup"), Some("fix"));
        assert_eq!(infer_type_from_prompt("Document the API"), Some("docs"));
        assert_eq!(infer_type_from_prompt("prefix handling"), None);
    }

    #[test]
    fn renders_all_pattern_variables() {
        let vars = BranchVars {
            project: "shop",
            task_slug: "20250307-add-cart",
            prompt: "Add a cart",
            explicit_type: None,
            default_type: "feature",
        };
        assert_eq!(
            render_branch_name("{project}/{type}/{date}/{slug}", &vars),
            "shop/feature/20250307/add-cart"
        );
        assert_eq!(
            render_branch_name("{project}/{task_id}", &vars),
            "shop/20250307-add-cart"
        );
        let vars = BranchVars {
            explicit_type: Some("chore"),
            ..vars
        };
        assert_eq!(render_branch_name("{type}/{slug}", &vars), "chore/add-cart");
    }

    #[test]
    fn validates_branch_patterns() {
        assert!(validate_branch_pattern("{project}/{task_id}").is_ok());
        for bad in ["a b", "x..y", "a//b", ".hidden", "/abs", "trail/", "x.lock", "a:b"] {
            assert!(validate_branch_pattern(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn sanitizes_path_components() {
        assert_eq!(sanitize_for_filesystem("my/proj:x"), "my-proj-x");
        assert_eq!(sanitize_for_filesystem("//a//"), "a");
    }
}
