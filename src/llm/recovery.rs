// src/llm/recovery.rs
//! Response recovery pipeline (spec §4.5.3, steps 1-6). Steps 7-9 (schema
//! check, risk normalization, plan-level risk recomputation) are semantic
//! and live in `generator.rs` once this module has produced a `Value`.

use serde_json::Value;

use crate::errors::GenerationError;

/// Runs fence stripping, object extraction, comment scrubbing, trailing-comma
/// repair, and control-character escaping, then parses the result as JSON —
/// retrying once with missing closing brackets appended if that's the only
/// parse failure.
pub fn recover_and_parse(raw: &str) -> Result<Value, GenerationError> {
    let stage = strip_fences(raw);
    let stage = extract_object(&stage).ok_or_else(|| GenerationError::ParseFailure {
        position: 0,
        context: truncated_context(&stage, 0),
    })?;
    let stage = scrub_comments(&stage);
    let stage = repair_trailing_commas(&stage);
    let stage = escape_control_chars(&stage);

    match serde_json::from_str::<Value>(&stage) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            let repaired = append_missing_closers(&stage);
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => Ok(value),
                Err(_) => Err(GenerationError::ParseFailure {
                    position: first_err.column(),
                    context: truncated_context(&stage, first_err.column()),
                }),
            }
        }
    }
}

fn strip_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("```json").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix("```").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim().to_string()
}

fn extract_object(s: &str) -> Option<String> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end < start {
        return None;
    }
    Some(s[start..=end].to_string())
}

fn scrub_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn repair_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let bytes: Vec<char> = s.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == ',' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == '}' || bytes[j] == ']') {
                i += 1;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }
    out
}

fn escape_control_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string && (c as u32) < 0x20 {
            out.push(' ');
            escaped = false;
            continue;
        }
        out.push(c);
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        }
    }
    out
}

/// Tracks a stack of open brackets outside of strings and appends the
/// matching closers in reverse order.
fn append_missing_closers(s: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut repaired = s.to_string();
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    repaired
}

fn truncated_context(s: &str, position: usize) -> String {
    let start = position.saturating_sub(200).min(s.len());
    let end = (position + 200).min(s.len());
    if start >= end {
        return String::new();
    }
    s.get(start..end).unwrap_or_default().to_string()
}
