//! Extraction of JSON documents and code from model responses.
//!
//! Models often wrap their answer in Markdown fences or put a sentence in
//! front of it. The helpers here peel that off before strict validation:
//! 1. fenced block (```json or bare ```)
//! 2. direct JSON if the content starts with '{'
//! 3. first balanced object anywhere in the content
//!
//! ```
//! use autoanalyst::utils::json_extraction::extract_json_object;
//!
//! let response = "Here is the plan:\n```json\n{\"analyses\": []}\n```";
//! assert_eq!(extract_json_object(response).unwrap(), "{\"analyses\": []}");
//! ```

use regex::Regex;
use thiserror::Error;

/// Error type for extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
    #[error("Response contains no code")]
    EmptyCode,
}

/// Return the body of the first fenced block, if any.
pub fn fenced_block(content: &str) -> Option<&str> {
    let re = Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").ok()?;
    re.captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Strip surrounding Markdown fences, returning the inner text trimmed.
///
/// Content with no fence is returned trimmed. An opening fence with no
/// closing fence (a truncated response) loses just the opening line.
pub fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(inner) = fenced_block(trimmed) {
        return inner;
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return match rest.find('\n') {
            Some(newline) => rest[newline + 1..].trim(),
            None => "",
        };
    }
    trimmed
}

/// Index of the brace closing the object that starts at `s[0]`.
///
/// String literals and escapes are honored so braces inside values do not
/// count.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn unclosed_braces(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

fn preview(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Extract a JSON object from a model response.
///
/// The returned text is syntactically valid JSON; shape validation is the
/// caller's job.
pub fn extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    if let Some(block) = fenced_block(trimmed) {
        if serde_json::from_str::<serde_json::Value>(block).is_ok() {
            return Ok(block.to_string());
        }
    }

    let unfenced = strip_fences(trimmed);
    if let Some(start) = unfenced.find('{') {
        let candidate = &unfenced[start..];
        if let Some(end) = find_matching_brace(candidate) {
            let object = &candidate[..=end];
            if serde_json::from_str::<serde_json::Value>(object).is_ok() {
                return Ok(object.to_string());
            }
        } else {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(candidate, 100),
                unclosed_braces: unclosed_braces(candidate),
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 50),
    })
}

/// Extract a runnable script from a code-generation response.
///
/// Fences are stripped and lines calling `plt.show()` are dropped, since an
/// interactive display call would block a headless run.
pub fn extract_code(content: &str) -> Result<String, JsonExtractionError> {
    let body = strip_fences(content);
    let code: Vec<&str> = body
        .lines()
        .filter(|line| !line.contains("plt.show()"))
        .collect();
    let code = code.join("\n");

    if code.trim().is_empty() {
        return Err(JsonExtractionError::EmptyCode);
    }
    Ok(format!("{}\n", code.trim_end()))
}
