//! Salvage: recover a single test file from output that did not parse as
//! structured data. Strategies only extract spans that already look like
//! complete declarations; nothing is invented.

use std::sync::LazyLock;

use regex::Regex;

use crate::parser::GeneratedTest;

static FENCED_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)(?:```|~~~)[A-Za-z0-9_+.\-]*[ \t]*\r?\n?(.*?)(?:```|~~~)").ok()
});

static IMPORT_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*import\s").ok());

static DECLARATION_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?s)\b(?:describe|test|it)\s*\(\s*["'`][^"'`]*["'`]\s*,.*?\}\s*\)\s*;"#).ok()
});

/// One independent extraction attempt over raw model text.
pub trait SalvageStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extracted code, or `None` if this strategy does not apply.
    fn extract(&self, raw: &str) -> Option<String>;
}

/// (a) The first fenced code block with non-blank content.
pub struct FencedBlock;

impl SalvageStrategy for FencedBlock {
    fn name(&self) -> &'static str {
        "fenced-block"
    }

    fn extract(&self, raw: &str) -> Option<String> {
        let re = FENCED_BLOCK.as_ref()?;
        re.captures_iter(raw)
            .map(|caps| caps[1].trim().to_string())
            .find(|code| !code.is_empty())
    }
}

/// (b) From the first import line to the last `});`.
pub struct ImportSpan;

impl SalvageStrategy for ImportSpan {
    fn name(&self) -> &'static str {
        "import-span"
    }

    fn extract(&self, raw: &str) -> Option<String> {
        let start = first_import(raw)?;
        let tail = &raw[start..];
        let end = tail.rfind("});")?;
        Some(tail[..end + 3].trim().to_string())
    }
}

/// (c) A test declaration block, paired with the import lines before it.
/// A declaration without imports is not a complete file and is skipped.
pub struct DeclarationBlock;

impl SalvageStrategy for DeclarationBlock {
    fn name(&self) -> &'static str {
        "declaration-block"
    }

    fn extract(&self, raw: &str) -> Option<String> {
        let re = DECLARATION_BLOCK.as_ref()?;
        let decl = re.find(raw)?;
        let before = &raw[..decl.start()];
        let import_start = first_import(before)?;
        let imports = before[import_start..].trim();
        Some(format!("{imports}\n\n{}", decl.as_str().trim()))
    }
}

/// Strategies in priority order.
pub fn default_strategies() -> Vec<Box<dyn SalvageStrategy>> {
    vec![
        Box::new(FencedBlock),
        Box::new(ImportSpan),
        Box::new(DeclarationBlock),
    ]
}

/// Run `strategies` in order; the first match becomes the code of a single
/// record named after the task.
pub fn salvage_with(
    strategies: &[Box<dyn SalvageStrategy>],
    raw: &str,
    file_name: &str,
    relative_dir: Option<&str>,
) -> Option<GeneratedTest> {
    strategies.iter().find_map(|strategy| {
        let code = strategy.extract(raw)?;
        tracing::debug!(strategy = strategy.name(), chars = code.len(), "salvaged code");
        Some(GeneratedTest {
            file_name: file_name.to_string(),
            relative_dir: relative_dir.map(str::to_string),
            code,
        })
    })
}

/// Salvage with the default strategy list.
pub fn salvage(raw: &str, file_name: &str, relative_dir: Option<&str>) -> Option<GeneratedTest> {
    salvage_with(&default_strategies(), raw, file_name, relative_dir)
}

fn first_import(s: &str) -> Option<usize> {
    let re = IMPORT_LINE.as_ref()?;
    let m = re.find(s)?;
    // Skip leading indentation captured by the match.
    Some(m.start() + (m.as_str().len() - m.as_str().trim_start().len()))
}
