use crate::{
    artifact::{read_text, reset_dir, write_atomic},
    condense::Condenser,
    config::{Config, FailurePolicy},
    error::{Error, Result},
    reduce::UNIFIED_DOCUMENT,
    report::{Stage, StageReport},
    template::TemplateEngine,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Collapses a document into its most compact line layout.
///
/// Lines are trimmed and blank lines dropped. Headings, code fence delimiters,
/// list items and table rows are kept as they are; any other line is appended to
/// the previous one with a single space when that one is plain text too.
///
/// Fence contents get no special treatment: plain code lines inside a fence
/// are joined like prose, which trades code layout for size.
///
/// Applying it twice gives the same result as applying it once.
#[must_use]
pub fn minify(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut previous_plain = false;

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let plain = !is_structural(line);
        match lines.last_mut() {
            Some(last) if plain && previous_plain => {
                last.push(' ');
                last.push_str(line);
            }
            _ => lines.push(line.to_string()),
        }
        previous_plain = plain;
    }

    lines.join("\n")
}

fn is_structural(line: &str) -> bool {
    line.starts_with('#')
        || line.starts_with("```")
        || line.starts_with('-')
        || line.starts_with("* ")
        || line.starts_with("+ ")
        || line.starts_with('|')
        || is_ordered_item(line)
}

/// `1. item` or `1) item`
fn is_ordered_item(line: &str) -> bool {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && (line[digits..].starts_with(". ") || line[digits..].starts_with(") "))
}

/// Stage 4: one formatting pass through the model, then [`minify`].
pub(crate) struct Compressor<'a> {
    condenser: &'a Condenser,
    templates: &'a TemplateEngine,
    input: PathBuf,
    output_dir: PathBuf,
    output: PathBuf,
    policy: FailurePolicy,
}

impl<'a> Compressor<'a> {
    pub(crate) fn new(config: &Config, condenser: &'a Condenser, templates: &'a TemplateEngine) -> Self {
        Self {
            condenser,
            templates,
            input: config.hierarchical_dir().join(UNIFIED_DOCUMENT),
            output_dir: config.final_dir(),
            output: config.final_document(),
            policy: config.on_failure,
        }
    }

    /// Writes the final document.
    ///
    /// # Errors
    ///
    /// Returns an error if the unified document is missing, the formatting pass
    /// fails under the `drop` policy, or the output cannot be written.
    #[instrument(skip(self), fields(input = %self.input.display()))]
    pub(crate) fn run(&self) -> Result<StageReport> {
        let start = Instant::now();

        if !self.input.is_file() {
            return Err(Error::precondition(
                Stage::Compress.name(),
                format!("unified document '{}' does not exist", self.input.display()),
            ));
        }
        let document = read_text(&self.input)?;

        reset_dir(&self.output_dir)?;

        let mut report = StageReport::new(Stage::Compress);
        let instruction = self.templates.compress()?;
        let result = self.condenser.reduce(&document, &instruction);

        let formatted = match result.content() {
            Some(formatted) => {
                report.record_success();
                formatted
            }
            None => {
                warn!("Formatting pass failed: {}", result.error_message());
                report.record_failure("format", result.error_message());
                match self.policy {
                    FailurePolicy::Raw => document.as_str(),
                    FailurePolicy::Drop => {
                        return Err(Error::llm(format!(
                            "formatting pass failed: {}",
                            result.error_message()
                        )));
                    }
                }
            }
        };

        let compressed = minify(formatted);
        write_atomic(&self.output, &compressed)?;

        let estimator = self.condenser.estimator();
        report.original_tokens = estimator.estimate(&document);
        report.condensed_tokens = estimator.estimate(&compressed);
        report.duration = start.elapsed();

        info!(
            "Wrote {} ({} -> {} tokens, ratio {:.2})",
            self.output.display(),
            report.original_tokens,
            report.condensed_tokens,
            report.compression_ratio()
        );
        Ok(report)
    }
}
