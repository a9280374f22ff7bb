//! Text transformations behind the structured patch types.
//!
//! All functions are pure: they take the current file text and return the
//! new text, or `None`/`Err` when the patch cannot be applied. Lines keep
//! their original endings.

use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::BTreeMap;

/// Front-matter delimiter line.
const FENCE: &str = "---";

// ============================================================================
// Headings
// ============================================================================

/// Text of an ATX heading line (`## Setup ##` -> `Setup`), if it is one.
#[must_use]
pub fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t', '\r', '\n']) {
        return None;
    }
    Some(strip_closing_sequence(rest.trim()))
}

/// Drop an ATX closing `#` run. It only counts when it is the whole text or
/// follows whitespace, so `C#` keeps its hash.
fn strip_closing_sequence(text: &str) -> &str {
    let without = text.trim_end_matches('#');
    if without.len() == text.len() {
        return text;
    }
    if without.is_empty() || without.ends_with([' ', '\t']) {
        without.trim_end()
    } else {
        text
    }
}

/// Anchor text as it is compared against headings.
#[must_use]
pub fn normalize_anchor(anchor: &str) -> &str {
    anchor.trim().trim_start_matches('#').trim()
}

/// Index of the first heading line whose text equals `anchor`.
#[must_use]
pub fn find_anchor(text: &str, anchor: &str) -> Option<usize> {
    let anchor = normalize_anchor(anchor);
    text.split_inclusive('\n')
        .position(|line| heading_text(line) == Some(anchor))
}

/// Insert `content` right after the `anchor` heading, framed by blank lines.
///
/// Returns `None` when the anchor does not exist.
#[must_use]
pub fn insert_after_anchor(text: &str, anchor: &str, content: &str) -> Option<String> {
    let index = find_anchor(text, anchor)?;
    let lines: Vec<&str> = text.split_inclusive('\n').collect();

    let mut out = String::with_capacity(text.len() + content.len() + 4);
    for line in &lines[..=index] {
        out.push_str(line);
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str(content.trim());
    out.push('\n');

    let rest: Vec<&str> = lines[index + 1..]
        .iter()
        .copied()
        .skip_while(|line| line.trim().is_empty())
        .collect();
    if !rest.is_empty() {
        out.push('\n');
        for line in rest {
            out.push_str(line);
        }
    }
    Some(out)
}

// ============================================================================
// Front matter
// ============================================================================

/// Split a leading `---` block into `(yaml, body)`.
#[must_use]
pub fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let mut lines = text.split_inclusive('\n');
    let first = lines.next()?;
    if first.trim_end() != FENCE {
        return None;
    }
    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        let end = offset + line.len();
        let marker = line.trim_end();
        if marker == FENCE || marker == "..." {
            return Some((&text[yaml_start..offset], &text[end..]));
        }
        offset = end;
    }
    None
}

/// Outcome of merging keys into front matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontmatterMerge {
    /// Every key already has the requested value.
    Unchanged,
    Updated(String),
}

/// Merge `keys` into the front matter of `text`, creating a block if needed.
///
/// # Errors
///
/// A message when the existing block is not a YAML mapping.
pub fn merge_frontmatter(
    text: &str,
    keys: &BTreeMap<String, serde_json::Value>,
) -> std::result::Result<FrontmatterMerge, String> {
    let (mut mapping, body) = match split_frontmatter(text) {
        Some((yaml, body)) => (parse_mapping(yaml)?, body),
        None => (Mapping::new(), text),
    };

    let mut desired = Vec::with_capacity(keys.len());
    for (key, value) in keys {
        let value = serde_yaml::to_value(value)
            .map_err(|e| format!("cannot encode key '{key}': {e}"))?;
        desired.push((YamlValue::String(key.clone()), value));
    }

    let already = split_frontmatter(text).is_some()
        && desired
            .iter()
            .all(|(k, v)| mapping.get(k).is_some_and(|current| current == v));
    if already {
        return Ok(FrontmatterMerge::Unchanged);
    }

    for (key, value) in desired {
        mapping.insert(key, value);
    }
    let yaml = serde_yaml::to_string(&mapping).map_err(|e| e.to_string())?;
    let mut out = String::with_capacity(yaml.len() + body.len() + 8);
    out.push_str(FENCE);
    out.push('\n');
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(FENCE);
    out.push('\n');
    out.push_str(body);

    if out == text {
        Ok(FrontmatterMerge::Unchanged)
    } else {
        Ok(FrontmatterMerge::Updated(out))
    }
}

fn parse_mapping(yaml: &str) -> std::result::Result<Mapping, String> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<YamlValue>(yaml) {
        Ok(YamlValue::Mapping(mapping)) => Ok(mapping),
        Ok(YamlValue::Null) => Ok(Mapping::new()),
        Ok(_) => Err("front matter is not a mapping".to_string()),
        Err(e) => Err(format!("front matter is not valid YAML: {e}")),
    }
}

// ============================================================================
// Line ranges
// ============================================================================

/// Replace the inclusive, 1-indexed line span `[start, end]` with `content`.
///
/// # Errors
///
/// A message when the span is empty, reversed or out of bounds.
pub fn replace_line_range(
    text: &str,
    start: usize,
    end: usize,
    content: &str,
) -> std::result::Result<String, String> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    if start < 1 {
        return Err(format!("start line {start} is before line 1"));
    }
    if start > end {
        return Err(format!("start line {start} is after end line {end}"));
    }
    if end > lines.len() {
        return Err(format!(
            "end line {end} is past the last line ({})",
            lines.len()
        ));
    }

    let mut out = String::with_capacity(text.len() + content.len());
    for line in &lines[..start - 1] {
        out.push_str(line);
    }
    out.push_str(content);
    let replaced_had_newline = lines[end - 1].ends_with('\n');
    if !content.is_empty() && replaced_had_newline && !content.ends_with('\n') {
        out.push('\n');
    }
    for line in &lines[end..] {
        out.push_str(line);
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
