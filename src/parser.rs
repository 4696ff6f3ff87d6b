use serde::{Deserialize, Serialize};

use crate::error::TestgenError;
use crate::sanitize::sanitize;

/// One generated test file as returned by the model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTest {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_dir: Option<String>,
    pub code: String,
}

/// The model's structured answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub tests: Vec<GeneratedTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Sanitize and parse model output into a `GenerationResponse`.
///
/// Strict parse first; on failure, the span from the first `{` to the last
/// `}` is parsed instead, which tolerates trailing commentary. Records with
/// a blank `fileName` are rejected.
pub fn parse_response(raw: &str) -> Result<GenerationResponse, TestgenError> {
    let cleaned = sanitize(raw);

    let parsed = match serde_json::from_str::<GenerationResponse>(&cleaned) {
        Ok(resp) => resp,
        Err(strict_err) => {
            let slice = brace_span(&cleaned).ok_or_else(|| {
                TestgenError::Parse(format!("no JSON object after sanitation: {strict_err}"))
            })?;
            serde_json::from_str::<GenerationResponse>(slice).map_err(|e| {
                TestgenError::Parse(format!("model did not return valid JSON after sanitation: {e}"))
            })?
        }
    };

    if let Some(pos) = parsed.tests.iter().position(|t| t.file_name.trim().is_empty()) {
        return Err(TestgenError::Parse(format!("test #{pos} has an empty fileName")));
    }

    Ok(parsed)
}

/// First `{` through last `}`, if they form a non-empty span.
fn brace_span(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}
