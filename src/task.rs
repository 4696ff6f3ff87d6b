use std::path::Path;

use serde::Deserialize;

use crate::error::TestgenError;
use crate::parser::GeneratedTest;
use crate::validate::ContentRules;

/// One unit of generation work. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenerationTask {
    /// Short label, e.g. the status value under test.
    pub label: String,
    /// Value substituted into the template's call.
    pub status_value: String,
    pub expected_code: u16,
    pub file_name: String,
    #[serde(default)]
    pub relative_dir: Option<String>,
    /// Natural-language requirement for this file.
    pub instruction: String,
}

/// Tasks plus everything needed to judge and replace their output.
#[derive(Debug, Clone)]
pub struct TaskFamily {
    pub name: String,
    pub tasks: Vec<GenerationTask>,
    pub rules: ContentRules,
    /// Deterministic fallback, with `{{LABEL}}`, `{{STATUS_VALUE}}`,
    /// `{{EXPECTED_CODE}}` and `{{FILE_NAME}}` placeholders.
    pub template: String,
    /// Requirements for a full-mode combined request.
    pub full_brief: String,
}

#[derive(Deserialize)]
struct TaskFamilyFile {
    name: String,
    template: String,
    #[serde(default)]
    full_brief: Option<String>,
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    forbidden: Vec<String>,
    tasks: Vec<GenerationTask>,
}

pub const PET_STATUS_TEMPLATE: &str = r#"import { HttpClient } from "../../../src/api/clients/http";
import { PetsAPI } from "../../../src/api/endpoints/pets";

describe("Pet findByStatus - {{LABEL}}", () => {
  const api = new PetsAPI(new HttpClient(process.env.BASE_URL || "http://127.0.0.1:8080/api/v3"));

  it("should return expected response for {{LABEL}} pets", async () => {
    const response = await api.findByStatus("{{STATUS_VALUE}}");
    expect(response.status).toBe({{EXPECTED_CODE}});
    expect(Array.isArray(response.data)).toBe(true);
  });
});
"#;

const PET_STATUS_FULL_BRIEF: &str = "Generate 3-5 new API tests covering:\n\
1) Pets: update pet (PUT) happy path and 404 on not found;\n\
2) Pets: findByStatus should return array and each item has id,name,status;\n\
3) Users: createWithList happy path and negative wrong types;\n\
4) Store: get inventory returns object of non-negative integers (skip test body if 5xx).\n\
All tests must import and use our HttpClient and endpoint classes.";

impl TaskFamily {
    /// The pet status search family.
    pub fn pet_status() -> Self {
        let task = |label: &str, value: &str, code: u16, instruction: &str| GenerationTask {
            label: label.to_string(),
            status_value: value.to_string(),
            expected_code: code,
            file_name: format!("pet.findByStatus.{label}.smoke.spec.ts"),
            relative_dir: None,
            instruction: instruction.to_string(),
        };

        let rules = ContentRules::new(
            [
                r#"import { HttpClient } from "../../../src/api/clients/http""#,
                r#"import { PetsAPI } from "../../../src/api/endpoints/pets""#,
                "new PetsAPI(new HttpClient(process.env.BASE_URL",
                "api.findByStatus(",
            ],
            [
                r"jest\.mock\(",
                r"import \{ Pet \}",
                r"import.*PetAPI.*from",
                r"beforeEach\(",
                r"new Pet\(",
                "axios",
            ],
        )
        .unwrap_or_else(|e| {
            tracing::error!("built-in rules failed to compile: {e}");
            ContentRules::permissive()
        });

        Self {
            name: "pet-status".to_string(),
            tasks: vec![
                task(
                    "available",
                    "available",
                    200,
                    "Assert 200, array, first item has id,name,status; majority status 'available'.",
                ),
                task(
                    "pending",
                    "pending",
                    200,
                    "Assert 200, array; if items exist majority status 'pending'.",
                ),
                task(
                    "invalid",
                    "__nonexistent__",
                    400,
                    "Call with '__nonexistent__'; expect 400 (or 200 empty array / 404).",
                ),
            ],
            rules,
            template: PET_STATUS_TEMPLATE.to_string(),
            full_brief: PET_STATUS_FULL_BRIEF.to_string(),
        }
    }

    /// Load a family from a TOML file.
    pub async fn load(path: &Path) -> Result<Self, TestgenError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            TestgenError::Config(format!("cannot read task file {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, TestgenError> {
        let file: TaskFamilyFile =
            toml::from_str(text).map_err(|e| TestgenError::Config(format!("task file: {e}")))?;

        if file.tasks.is_empty() {
            return Err(TestgenError::Config(format!(
                "task family '{}' defines no tasks",
                file.name
            )));
        }
        if let Some(t) = file.tasks.iter().find(|t| t.file_name.trim().is_empty()) {
            return Err(TestgenError::Config(format!(
                "task '{}' has an empty file_name",
                t.label
            )));
        }

        Ok(Self {
            rules: ContentRules::new(file.required, file.forbidden)?,
            full_brief: file
                .full_brief
                .unwrap_or_else(|| format!("Generate tests for the '{}' family.", file.name)),
            name: file.name,
            tasks: file.tasks,
            template: file.template,
        })
    }

    /// Number of records a combined smoke request must return.
    pub fn expected_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn render(&self, task: &GenerationTask) -> String {
        render_template(&self.template, task)
    }

    /// Deterministic replacement record for `task`.
    pub fn fallback(&self, task: &GenerationTask) -> GeneratedTest {
        GeneratedTest {
            file_name: task.file_name.clone(),
            relative_dir: task.relative_dir.clone(),
            code: self.render(task),
        }
    }

    /// Task whose file name matches `file_name`, if any.
    pub fn task_for_file(&self, file_name: &str) -> Option<&GenerationTask> {
        self.tasks.iter().find(|t| t.file_name == file_name)
    }
}

pub fn render_template(template: &str, task: &GenerationTask) -> String {
    template
        .replace("{{LABEL}}", &task.label)
        .replace("{{STATUS_VALUE}}", &task.status_value)
        .replace("{{EXPECTED_CODE}}", &task.expected_code.to_string())
        .replace("{{FILE_NAME}}", &task.file_name)
}
