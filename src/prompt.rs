use std::fmt::Write as _;

use crate::config::Mode;
use crate::parser::{GeneratedTest, GenerationResponse};
use crate::task::{GenerationTask, TaskFamily};

/// A system/user prompt pair, flattened into one completion prompt on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn render(&self) -> String {
        format!("SYSTEM:\n{}\n\nUSER:\n{}\n", self.system, self.user)
    }
}

/// The exact envelope the model must answer with.
fn envelope(file_name: &str, relative_dir: &str, code: &str) -> String {
    let sample = GenerationResponse {
        tests: vec![GeneratedTest {
            file_name: file_name.to_string(),
            relative_dir: Some(relative_dir.to_string()),
            code: code.to_string(),
        }],
        notes: None,
    };
    serde_json::to_string(&sample).unwrap_or_default()
}

/// System prompt: the template, the family's content rules, and the answer format.
pub fn system_prompt(family: &TaskFamily, output_dir: &str) -> String {
    let mut out = String::from("CRITICAL: You MUST follow this EXACT template. NO variations allowed.\n\n");
    out.push_str(
        "TEMPLATE (replace {{LABEL}}, {{STATUS_VALUE}} and {{EXPECTED_CODE}} only):\n",
    );
    out.push_str(family.template.trim_end());
    out.push_str("\n\nRULES:\n");
    for required in family.rules.required() {
        let _ = writeln!(out, "- MUST contain exactly: {required}");
    }
    for forbidden in family.rules.forbidden() {
        let _ = writeln!(out, "- MUST NOT match: {forbidden}");
    }
    let _ = writeln!(
        out,
        "- Return JSON: {}",
        envelope("name.spec.ts", output_dir, "COMPLETE_FILE_CODE")
    );
    out.push_str("NO explanations, NO markdown, ONLY JSON.");
    out
}

/// User prompt for a combined request.
///
/// Smoke mode enumerates every task and demands exactly that many records;
/// full mode hands over the family's open-ended brief.
pub fn user_prompt(mode: Mode, family: &TaskFamily, context: &str) -> String {
    let requirements = match mode {
        Mode::Smoke => smoke_requirements(family),
        Mode::Full => family.full_brief.clone(),
    };

    format!(
        "CONTEXT FILES (read-only, show style and imports):\n{context}\n\n\
         REQUIREMENTS:\n{requirements}\n\n\
         CRITICAL: Follow the EXACT import pattern shown in context files.\n\
         OUTPUT:\n\
         Return JSON exactly as specified. Every \"code\" value must be a complete, syntactically valid file."
    )
}

fn smoke_requirements(family: &TaskFamily) -> String {
    let count = family.expected_count();
    let mut out = format!(
        "Generate {count} concise test files. Each file must be COMPLETE with proper imports and syntax, following the template.\n"
    );
    for (i, task) in family.tasks.iter().enumerate() {
        let _ = writeln!(
            out,
            "FILE {}: LABEL=\"{}\", STATUS_VALUE=\"{}\", EXPECTED_CODE={}, fileName={}. {}",
            file_letter(i),
            task.label,
            task.status_value,
            task.expected_code,
            task.file_name,
            task.instruction
        );
    }
    out.push_str("CRITICAL: Each file must be syntactically complete with all braces, quotes, and semicolons properly closed.\n");
    let _ = write!(out, "Return JSON with a tests[] array of exactly {count} complete objects.");
    out
}

/// `A`..`Z`, then numbered.
fn file_letter(i: usize) -> String {
    match u8::try_from(i) {
        Ok(n) if n < 26 => char::from(b'A' + n).to_string(),
        _ => (i + 1).to_string(),
    }
}

/// Prompt for one task in incremental mode: the rendered template to copy
/// and the envelope to wrap it in.
pub fn single_prompt(family: &TaskFamily, task: &GenerationTask, output_dir: &str) -> String {
    let relative_dir = task.relative_dir.as_deref().unwrap_or(output_dir);
    format!(
        "COPY this file exactly. Requirement: {}\n\n{}\n\nReturn JSON: {}",
        task.instruction,
        family.render(task).trim_end(),
        envelope(&task.file_name, relative_dir, "COMPLETE_FILE_ABOVE")
    )
}
