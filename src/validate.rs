use regex::{Regex, RegexBuilder};

use crate::error::TestgenError;

/// Required/forbidden content rules for one task family.
///
/// Every required substring must appear verbatim; no forbidden pattern
/// (case-insensitive regex) may match. A failing record is never written.
#[derive(Debug, Clone)]
pub struct ContentRules {
    required: Vec<String>,
    forbidden: Vec<Regex>,
}

impl ContentRules {
    pub fn new<R, F>(required: R, forbidden: F) -> Result<Self, TestgenError>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        F: IntoIterator,
        F::Item: AsRef<str>,
    {
        let forbidden = forbidden
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| TestgenError::Config(format!("bad forbidden pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            required: required.into_iter().map(Into::into).collect(),
            forbidden,
        })
    }

    /// Rules that accept anything.
    pub fn permissive() -> Self {
        Self {
            required: vec![],
            forbidden: vec![],
        }
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn forbidden(&self) -> impl Iterator<Item = &str> {
        self.forbidden.iter().map(Regex::as_str)
    }

    /// Check `code`, naming the first rule it breaks.
    pub fn check(&self, code: &str) -> Result<(), TestgenError> {
        if let Some(missing) = self.required.iter().find(|r| !code.contains(r.as_str())) {
            return Err(TestgenError::Validation(format!(
                "missing required content: {missing}"
            )));
        }
        if let Some(hit) = self.forbidden.iter().find(|re| re.is_match(code)) {
            return Err(TestgenError::Validation(format!(
                "contains forbidden pattern: {}",
                hit.as_str()
            )));
        }
        Ok(())
    }
}
