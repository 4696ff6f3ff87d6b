//! Output sanitizer: normalizes raw model text into something the
//! structured parser can read.

use std::sync::LazyLock;

use regex::Regex;

static LEADING_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:```|~~~)[A-Za-z0-9_+.\-]*[ \t]*(?:\r?\n)?").ok());

static TRAILING_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:\r?\n)?[ \t]*(?:```|~~~)\s*$").ok());

/// `"field": `...``: a template-literal value inside otherwise-JSON output.
static BACKTICK_VALUE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"("[A-Za-z_][A-Za-z0-9_]*")\s*:\s*`([^`]*)`"#).ok());

/// Normalize raw model output. Pure and idempotent:
/// `sanitize(&sanitize(x)) == sanitize(x)`.
///
/// Passes are repeated until the text stops changing. Each changing pass
/// either removes backticks or shortens the text without adding any, so
/// the loop terminates, and its result is a fixpoint of a single pass.
pub fn sanitize(raw: &str) -> String {
    let mut current = raw.to_string();
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn sanitize_pass(input: &str) -> String {
    let mut s = input.trim();

    // Conversational preamble before the JSON object.
    if let Some(brace) = s.find('{')
        && brace > 0
    {
        s = &s[brace..];
    }

    let s = strip(&LEADING_FENCE, s);
    let s = strip(&TRAILING_FENCE, &s);
    let s = s.trim();

    match BACKTICK_VALUE.as_ref() {
        Some(re) => re
            .replace_all(s, |caps: &regex::Captures| {
                let encoded =
                    serde_json::to_string(&caps[2]).unwrap_or_else(|_| "\"\"".to_string());
                format!("{}:{encoded}", &caps[1])
            })
            .into_owned(),
        None => s.to_string(),
    }
}

fn strip(re: &LazyLock<Option<Regex>>, s: &str) -> String {
    match re.as_ref() {
        Some(re) => re.replace(s, "").into_owned(),
        None => s.to_string(),
    }
}
