//! Requirement strings and canonical package names
//!
//! Requirements are compared by canonical distribution name only: the name is
//! lowercased, extras (`pkg[extra]`), version operators (`>=1.0`) and
//! environment markers (`; python_version < "3.9"`) are stripped, and runs of
//! `-`, `_` and `.` collapse to a single `-`.

use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)").expect("static regex")
    })
}

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[-_.]+").expect("static regex"))
}

/// Canonical name of a requirement or installed distribution.
///
/// Returns `None` when the string does not start with a package name
/// (URLs, local paths, pip options).
pub fn canonical_name(requirement: &str) -> Option<String> {
    let caps = name_pattern().captures(requirement)?;
    let name = caps.get(1)?.as_str();
    Some(
        separator_pattern()
            .replace_all(&name.to_ascii_lowercase(), "-")
            .into_owned(),
    )
}

/// Comparison key for a requirement: its canonical name, or the trimmed,
/// lowercased raw string when no name can be extracted.
fn requirement_key(requirement: &str) -> String {
    canonical_name(requirement).unwrap_or_else(|| requirement.trim().to_ascii_lowercase())
}

/// Packages implied by a service type regardless of what the release declares.
pub fn base_requirements(service_type: &str) -> &'static [&'static str] {
    match service_type.trim().to_ascii_lowercase().as_str() {
        "fastapi" => &["fastapi", "uvicorn"],
        "flask" => &["flask", "gunicorn"],
        _ => &[],
    }
}

/// Parse the lines of a `requirements.txt` style file.
///
/// Blank lines, `#` comments and option lines (`-r`, `--index-url`, ...) are
/// skipped; trailing inline comments are removed.
pub fn parse_requirements_file(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| match line.find(" #") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(str::to_string)
        .collect()
}

/// De-duplicate requirements by canonical name, keeping the first occurrence
/// and the original order.
pub fn dedup_requirements<I, S>(requirements: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for req in requirements {
        let req = req.as_ref().trim();
        if req.is_empty() {
            continue;
        }
        if seen.insert(requirement_key(req)) {
            out.push(req.to_string());
        }
    }
    out
}

/// Full required set for a release: user-declared requirements first, then
/// the service type's base packages the user did not already name.
pub fn required_set(service_type: &str, declared: &[String]) -> Vec<String> {
    dedup_requirements(
        declared
            .iter()
            .map(String::as_str)
            .chain(base_requirements(service_type).iter().copied()),
    )
}

/// Requirements whose canonical name is absent from `installed`.
///
/// `installed` must hold canonical names (see [`canonical_name`]). Output
/// keeps declaration order and drops duplicates.
pub fn missing_requirements(required: &[String], installed: &BTreeSet<String>) -> Vec<String> {
    dedup_requirements(required)
        .into_iter()
        .filter(|req| !installed.contains(&requirement_key(req)))
        .collect()
}
