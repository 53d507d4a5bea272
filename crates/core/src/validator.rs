use crate::error::PipelineError;
use crate::schema::{AnswerSchema, StructuredAnswer};
use crate::synthesizer::{generate_with_timeout, RawAnswer};
use crate::traits::GenerationProvider;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

const FENCED_JSON_PATTERN: &str = r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```";

fn fenced_json_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(FENCED_JSON_PATTERN).ok())
        .as_ref()
}

/// Validates provider output against an [`AnswerSchema`], allowing one repair pass.
#[derive(Clone)]
pub struct StructuredOutputValidator {
    schema: AnswerSchema,
    repair_provider: Option<Arc<dyn GenerationProvider>>,
    timeout: Duration,
}

impl StructuredOutputValidator {
    pub fn new(schema: AnswerSchema) -> Self {
        Self {
            schema,
            repair_provider: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Lets the single repair pass re-prompt `provider` when local extraction fails.
    pub fn with_repair_provider(
        mut self,
        provider: Option<Arc<dyn GenerationProvider>>,
        timeout: Duration,
    ) -> Self {
        self.repair_provider = provider;
        self.timeout = timeout;
        self
    }

    pub fn schema(&self) -> &AnswerSchema {
        &self.schema
    }

    /// Strict parse: the whole output is one JSON object, optionally inside a single code fence.
    pub fn parse_strict(&self, text: &str) -> Result<StructuredAnswer, String> {
        let body = strip_code_fence(text.trim());
        let value: Value = serde_json::from_str(body).map_err(|error| error.to_string())?;
        self.schema.conform(value).map_err(|error| error.to_string())
    }

    pub async fn validate(&self, raw: &RawAnswer) -> Result<StructuredAnswer, PipelineError> {
        let first_error = match self.parse_strict(&raw.text) {
            Ok(answer) => return Ok(answer),
            Err(error) => error,
        };

        warn!(error = %first_error, "structured output invalid, attempting repair");
        let repaired = self.repair(&raw.text, &first_error).await;
        if repaired.is_ok() {
            info!("structured output repaired");
        }
        repaired
    }

    async fn repair(&self, text: &str, error: &str) -> Result<StructuredAnswer, PipelineError> {
        if let Ok(answer) = self.parse_embedded(text) {
            return Ok(answer);
        }

        let Some(provider) = self.repair_provider.as_deref() else {
            return Err(PipelineError::StructuredOutput(format!(
                "{error}; no generation provider available for repair"
            )));
        };

        let prompt = self.repair_prompt(text, error);
        let reply = generate_with_timeout(provider, &prompt, self.timeout)
            .await
            .map_err(|failure| {
                PipelineError::StructuredOutput(format!("repair attempt failed: {failure}"))
            })?;

        self.parse_strict(&reply)
            .or_else(|_| self.parse_embedded(&reply))
            .map_err(|failure| {
                PipelineError::StructuredOutput(format!(
                    "output still invalid after repair: {failure}"
                ))
            })
    }

    /// Best-effort pass: a fenced JSON block anywhere in the text, then the outermost braces.
    fn parse_embedded(&self, text: &str) -> Result<StructuredAnswer, String> {
        let fenced = fenced_json_regex()
            .and_then(|regex| regex.captures(text))
            .and_then(|captures| captures.get(1))
            .map(|found| found.as_str());

        let mut last_error = "no JSON object found in output".to_string();
        for candidate in [fenced, outermost_braces(text)].into_iter().flatten() {
            match self.parse_strict(candidate) {
                Ok(answer) => return Ok(answer),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    fn repair_prompt(&self, text: &str, error: &str) -> String {
        format!(
            "The output below does not match the required format.\n\nError: {error}\n\n\
             Output:\n{text}\n\nRewrite it so that it matches the schema exactly, using only \
             information already present in the output.\n\n{}",
            self.schema.format_instructions()
        )
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = inner.strip_suffix("```") else {
        return text;
    };
    let inner = inner
        .strip_prefix("json")
        .or_else(|| inner.strip_prefix("JSON"))
        .unwrap_or(inner);
    inner.trim()
}

fn outermost_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
