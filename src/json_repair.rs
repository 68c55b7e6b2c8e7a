//! Best-effort recovery of JSON emitted by a language model
//!
//! Model replies often wrap JSON in code fences, leave trailing commas or put raw
//! newlines inside string literals. The repairs here fix exactly those three
//! defects and leave valid JSON untouched; whatever still fails to parse into the
//! expected type is reported as an error so callers can fall back explicitly.

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```[A-Za-z0-9_-]*[ \t]*\r?\n?").expect("fence pattern is valid")
});

/// Remove markdown code-fence markers (with an optional language tag)
pub fn strip_code_fences(s: &str) -> String {
    FENCE.replace_all(s, "").trim().to_string()
}

/// Drop commas that directly precede a closing `}` or `]` outside string literals
pub fn remove_trailing_commas(s: &str) -> String {
    scan(s, true, false)
}

/// Escape raw newlines, carriage returns and tabs that appear inside string literals
pub fn escape_newlines_in_strings(s: &str) -> String {
    scan(s, false, true)
}

/// Full repair pipeline applied before parsing model output
pub fn prepare_for_json(s: &str) -> String {
    let unfenced = strip_code_fences(s);
    escape_newlines_in_strings(&remove_trailing_commas(&unfenced))
}

/// Outermost `{ ... }` span, for replies that surround the object with prose
pub fn extract_json_block(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end > start {
        Some(&s[start..=end])
    } else {
        None
    }
}

/// Repair `raw` and deserialize it into `T`, retrying on the outermost object
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let prepared = prepare_for_json(raw);
    match serde_json::from_str::<T>(&prepared) {
        Ok(value) => Ok(value),
        Err(first) => {
            let block = extract_json_block(&prepared)
                .ok_or_else(|| anyhow!("no JSON object found in model output: {first}"))?;
            serde_json::from_str::<T>(block).context("model output is not valid JSON for the expected shape")
        }
    }
}

fn scan(s: &str, drop_trailing_commas: bool, escape_controls: bool) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' if escape_controls => out.push_str("\\n"),
                '\r' if escape_controls => out.push_str("\\r"),
                '\t' if escape_controls => out.push_str("\\t"),
                _ => out.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' if drop_trailing_commas
                && matches!(
                    chars[i + 1..].iter().find(|ch| !ch.is_whitespace()),
                    Some('}') | Some(']')
                ) => {}
            _ => out.push(c),
        }
    }

    out
}
