//! Built-in plugins
//!
//! A small set of plugins shipped with the engine: enough to exercise every
//! stage without external code, and the default registry contents for the
//! bundled server binary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::logging::PluginLogger;

use super::registry::{GraderFactory, TranscriberFactory, ValidatorFactory};
use super::{
    GradePlugin, GradeResult, Plugin, PluginKind, PluginMetadata, PluginRegistry, SettingsField,
    SubmissionView, TranscribedSubmission, TranscriptionPlugin, ValidationPlugin,
};

/// Register every built-in plugin
pub fn register_builtins(registry: &PluginRegistry) -> Result<()> {
    registry.register_transcriber(Arc::new(PlainTextTranscriberFactory))?;
    registry.register_grader(Arc::new(KeywordGraderFactory))?;
    registry.register_validator(Arc::new(ScoreRangeValidatorFactory))?;
    Ok(())
}

/// Reads UTF-8 text artifacts from disk and concatenates them
///
/// File reads are blocking, so the engine runs this plugin on a worker
/// thread. Confidence is always 1.0: nothing is inferred.
pub struct PlainTextTranscriber {
    logger: PluginLogger,
    max_bytes: u64,
}

const PLAIN_TEXT_TRANSCRIBER_ID: &str = "gradekit.builtin.plain-text-transcriber";

impl Plugin for PlainTextTranscriber {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: PLAIN_TEXT_TRANSCRIBER_ID.to_string(),
            name: "Plain Text Transcriber".to_string(),
            author: "Gradekit".to_string(),
            version: Some("1.0.0".to_string()),
            kind: PluginKind::Transcription,
        }
    }

    fn settings_schema(&self) -> Vec<SettingsField> {
        vec![SettingsField::number(
            "max_bytes",
            "Maximum bytes read per artifact",
            1_048_576.0,
        )
        .range(Some(1.0), None)]
    }

    fn configure(&mut self, values: &Map<String, Value>) -> Result<()> {
        if let Some(max_bytes) = values.get("max_bytes").and_then(Value::as_f64) {
            self.max_bytes = max_bytes as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptionPlugin for PlainTextTranscriber {
    fn blocking(&self) -> bool {
        true
    }

    fn transcribe_blocking(&self, submission: &SubmissionView) -> Result<TranscribedSubmission> {
        let mut parts = Vec::new();
        for artifact in &submission.artifacts {
            if !artifact.mime.starts_with("text/") {
                self.logger.debug(format!(
                    "Skipping non-text artifact '{}' ({})",
                    artifact.title, artifact.mime
                ));
                continue;
            }
            let bytes = std::fs::read(&artifact.storage_path).map_err(|e| {
                Error::PluginRuntime(format!("cannot read artifact '{}': {e}", artifact.title))
            })?;
            let bytes = &bytes[..bytes.len().min(self.max_bytes as usize)];
            let text = String::from_utf8_lossy(bytes);
            parts.push(text.into_owned());
        }

        if parts.is_empty() {
            return Err(Error::PluginRuntime(format!(
                "submission {} has no readable text artifacts",
                submission.id
            )));
        }

        Ok(TranscribedSubmission {
            transcription: parts.join("\n\n"),
            confidence: 1.0,
        })
    }
}

struct PlainTextTranscriberFactory;

impl TranscriberFactory for PlainTextTranscriberFactory {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: PLAIN_TEXT_TRANSCRIBER_ID.to_string(),
            name: "Plain Text Transcriber".to_string(),
            author: "Gradekit".to_string(),
            version: Some("1.0.0".to_string()),
            kind: PluginKind::Transcription,
        }
    }

    fn create(&self, logger: PluginLogger) -> Result<Box<dyn TranscriptionPlugin>> {
        Ok(Box::new(PlainTextTranscriber {
            logger,
            max_bytes: 1_048_576,
        }))
    }
}

/// Scores a transcription by the fraction of configured keywords it contains
///
/// The score is scaled to the assignment's maximum (or 100 when the
/// assignment declares none); feedback lists the missing keywords.
pub struct KeywordGrader {
    logger: PluginLogger,
    keywords: Vec<String>,
    case_sensitive: bool,
}

const KEYWORD_GRADER_ID: &str = "gradekit.builtin.keyword-grader";

impl Plugin for KeywordGrader {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: KEYWORD_GRADER_ID.to_string(),
            name: "Keyword Grader".to_string(),
            author: "Gradekit".to_string(),
            version: Some("1.0.0".to_string()),
            kind: PluginKind::Grade,
        }
    }

    fn settings_schema(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::text("keywords", "Comma-separated keywords to look for", "")
                .required()
                .length(Some(1), None),
            SettingsField::switch("case_sensitive", "Match case exactly", false),
        ]
    }

    fn configure(&mut self, values: &Map<String, Value>) -> Result<()> {
        let raw = values
            .get("keywords")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.keywords = raw
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect();
        if self.keywords.is_empty() {
            return Err(Error::Settings("keywords must name at least one keyword".to_string()));
        }
        self.case_sensitive = values
            .get("case_sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(())
    }
}

#[async_trait]
impl GradePlugin for KeywordGrader {
    async fn grade(
        &self,
        transcribed: &TranscribedSubmission,
        original: &SubmissionView,
    ) -> Result<GradeResult> {
        let haystack = if self.case_sensitive {
            transcribed.transcription.clone()
        } else {
            transcribed.transcription.to_lowercase()
        };

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for keyword in &self.keywords {
            let needle = if self.case_sensitive {
                keyword.clone()
            } else {
                keyword.to_lowercase()
            };
            if haystack.contains(&needle) {
                found.push(keyword.clone());
            } else {
                missing.push(keyword.clone());
            }
        }

        let scale = if original.assignment.max_score > 0.0 {
            original.assignment.max_score
        } else {
            100.0
        };
        let score = scale * found.len() as f64 / self.keywords.len() as f64;

        self.logger.debug(format!(
            "Matched {}/{} keywords for submission {}",
            found.len(),
            self.keywords.len(),
            original.id
        ));

        let feedback = if missing.is_empty() {
            format!("All {} keywords present.", self.keywords.len())
        } else {
            format!(
                "Found {}/{} keywords. Missing: {}.",
                found.len(),
                self.keywords.len(),
                missing.join(", ")
            )
        };

        let mut meta = Map::new();
        meta.insert("keywords_found".to_string(), Value::from(found));
        meta.insert("keywords_missing".to_string(), Value::from(missing));

        Ok(GradeResult {
            score,
            feedback,
            meta,
        })
    }
}

struct KeywordGraderFactory;

impl GraderFactory for KeywordGraderFactory {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: KEYWORD_GRADER_ID.to_string(),
            name: "Keyword Grader".to_string(),
            author: "Gradekit".to_string(),
            version: Some("1.0.0".to_string()),
            kind: PluginKind::Grade,
        }
    }

    fn create(&self, logger: PluginLogger) -> Result<Box<dyn GradePlugin>> {
        Ok(Box::new(KeywordGrader {
            logger,
            keywords: Vec::new(),
            case_sensitive: false,
        }))
    }
}

/// Flags grade results whose score falls outside `[0, max]`
pub struct ScoreRangeValidator {
    max: f64,
}

const SCORE_RANGE_VALIDATOR_ID: &str = "gradekit.builtin.score-range-validator";

impl Plugin for ScoreRangeValidator {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: SCORE_RANGE_VALIDATOR_ID.to_string(),
            name: "Score Range Validator".to_string(),
            author: "Gradekit".to_string(),
            version: Some("1.0.0".to_string()),
            kind: PluginKind::Validation,
        }
    }

    fn settings_schema(&self) -> Vec<SettingsField> {
        vec![SettingsField::number("max", "Highest acceptable score", 100.0)]
    }

    fn configure(&mut self, values: &Map<String, Value>) -> Result<()> {
        if let Some(max) = values.get("max").and_then(Value::as_f64) {
            self.max = max;
        }
        Ok(())
    }
}

#[async_trait]
impl ValidationPlugin for ScoreRangeValidator {
    async fn validate_one(&self, grade: &GradeResult) -> Result<bool> {
        Ok(grade.score >= 0.0 && grade.score <= self.max && grade.score.is_finite())
    }
}

struct ScoreRangeValidatorFactory;

impl ValidatorFactory for ScoreRangeValidatorFactory {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: SCORE_RANGE_VALIDATOR_ID.to_string(),
            name: "Score Range Validator".to_string(),
            author: "Gradekit".to_string(),
            version: Some("1.0.0".to_string()),
            kind: PluginKind::Validation,
        }
    }

    fn create(&self, _logger: PluginLogger) -> Result<Box<dyn ValidationPlugin>> {
        Ok(Box::new(ScoreRangeValidator { max: 100.0 }))
    }
}
