use crate::{
    artifact::{list_dirs, list_files, read_text, reset_dir, stem_of, write_atomic},
    condense::Condenser,
    config::{Config, FailurePolicy},
    error::{Error, Result},
    extract::strip_provenance,
    pool::run_ordered,
    report::{Stage, StageReport},
    template::TemplateEngine,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What happened to one topic.
#[derive(Debug)]
struct TopicOutcome {
    topic_id: String,
    original_tokens: usize,
    written_tokens: usize,
    error: Option<String>,
}

/// Stage 2: merges the fragments of each topic into one section.
pub(crate) struct TopicMerger<'a> {
    condenser: &'a Condenser,
    templates: &'a TemplateEngine,
    input_dir: PathBuf,
    output_dir: PathBuf,
    names: HashMap<String, String>,
    workers: usize,
    policy: FailurePolicy,
}

impl<'a> TopicMerger<'a> {
    pub(crate) fn new(config: &Config, condenser: &'a Condenser, templates: &'a TemplateEngine) -> Self {
        Self {
            condenser,
            templates,
            input_dir: config.extraction_dir(),
            output_dir: config.merged_dir(),
            names: config
                .topics
                .iter()
                .map(|t| (t.id.clone(), t.display_name().to_string()))
                .collect(),
            workers: config.merge.max_workers,
            policy: config.on_failure,
        }
    }

    /// Writes `<output>/<topic_id>.txt` for every extracted topic.
    ///
    /// Topics are independent: a failed merge is logged and resolved by the
    /// failure policy while the others continue.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no extracted topics or an artifact cannot be
    /// read or written.
    #[instrument(skip(self), fields(input_dir = %self.input_dir.display()))]
    pub(crate) fn run(&self) -> Result<StageReport> {
        let start = Instant::now();

        let topic_dirs = if self.input_dir.is_dir() {
            list_dirs(&self.input_dir)?
        } else {
            Vec::new()
        };
        if topic_dirs.is_empty() {
            return Err(Error::precondition(
                Stage::Merge.name(),
                format!("no extracted topics in '{}'", self.input_dir.display()),
            ));
        }

        reset_dir(&self.output_dir)?;
        info!("Merging {} topics", topic_dirs.len());

        let outcomes = run_ordered("merge", self.workers, topic_dirs, |_, dir| self.merge_topic(&dir))?;

        let mut report = StageReport::new(Stage::Merge);
        for outcome in outcomes {
            let outcome = outcome?;
            report.original_tokens += outcome.original_tokens;
            report.condensed_tokens += outcome.written_tokens;
            match outcome.error {
                None => report.record_success(),
                Some(error) => report.record_failure(format!("topic:{}", outcome.topic_id), error),
            }
        }

        report.duration = start.elapsed();
        info!(
            "Merged {} topics ({} failed), {} -> {} tokens",
            report.succeeded, report.failed, report.original_tokens, report.condensed_tokens
        );
        Ok(report)
    }

    fn merge_topic(&self, dir: &Path) -> Result<TopicOutcome> {
        let topic_id = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = self.names.get(&topic_id).map_or(topic_id.as_str(), String::as_str);

        let mut fragments = Vec::new();
        for path in list_files(dir, "md")? {
            let fragment = strip_provenance(&read_text(&path)?);
            if !fragment.is_empty() {
                fragments.push(fragment);
            }
        }
        let combined = fragments.join("\n\n");
        debug!("Topic {}: {} fragments, {} chars", topic_id, fragments.len(), combined.len());

        let instruction = self.templates.merge(&topic_id, name)?;
        let result = self.condenser.reduce(&combined, &instruction);

        let (body, error) = match result.content() {
            Some(merged) => (Some(merged.trim()), None),
            None => {
                warn!("Topic {} failed: {}", topic_id, result.error_message());
                let fallback = match self.policy {
                    FailurePolicy::Raw => Some(combined.as_str()),
                    FailurePolicy::Drop => None,
                };
                (fallback, Some(result.error_message().to_string()))
            }
        };

        let mut written_tokens = 0;
        if let Some(body) = body {
            let document = format!("# {name}\n\n{body}\n");
            written_tokens = self.condenser.estimator().estimate(&document);
            write_atomic(&self.output_dir.join(format!("{topic_id}.txt")), &document)?;
        }

        Ok(TopicOutcome {
            topic_id,
            original_tokens: result.original_tokens,
            written_tokens,
            error,
        })
    }
}

/// Lists the merged topic documents in processing order.
pub(crate) fn merged_documents(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    Ok(list_files(dir, "txt")?
        .into_iter()
        .map(|path| (stem_of(&path), path))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PromptConfig, TopicConfig};
    use crate::extract::provenance_header;
    use crate::llm::testing::{document_of, ScriptedModel};
    use crate::llm::LlmError;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use std::sync::Arc;

    fn setup(policy: FailurePolicy) -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        for (topic, file, body) in [
            ("walkers", "b_guide", "## Spawning\nSpawn walkers on nodes."),
            ("walkers", "a_intro", "# Walkers\nWalkers move."),
            ("edges", "ref", "# Edges\nEdges link nodes."),
        ] {
            temp.child(format!("out/1_extracted/{topic}/{file}.md"))
                .write_str(&format!("{}\n\n{body}\n", provenance_header(file, topic)))
                .unwrap();
        }
        let config = Config::builder()
            .source_dir(temp.path().join("docs"))
            .output_dir(temp.path().join("out"))
            .topics(vec![TopicConfig::new("walkers", "Walkers and Spawning", &["walker"])])
            .on_failure(policy)
            .max_retries(2)
            .retry_delay_ms(0)
            .build()
            .unwrap();
        (temp, config)
    }

    fn run_merge<F>(config: &Config, model: Arc<ScriptedModel<F>>) -> Result<StageReport>
    where
        F: Fn(&str) -> std::result::Result<String, LlmError> + Send + Sync + 'static,
    {
        let condenser = Condenser::new(config, model);
        let templates = TemplateEngine::new(&PromptConfig::default()).unwrap();
        TopicMerger::new(config, &condenser, &templates).run()
    }

    #[test]
    fn test_merges_each_topic() {
        let (temp, config) = setup(FailurePolicy::Raw);
        let model = Arc::new(ScriptedModel::new(|prompt: &str| {
            Ok(format!("MERGED[{}]", document_of(prompt).replace('\n', "|")))
        }));

        let report = run_merge(&config, model.clone()).unwrap();

        assert_eq!(model.calls(), 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);

        // fragments are sorted by file name and stripped of their headers
        temp.child("out/2_merged/walkers.txt").assert(
            "# Walkers and Spawning\n\nMERGED[# Walkers|Walkers move.||## Spawning|Spawn walkers on nodes.]\n",
        );
        temp.child("out/2_merged/edges.txt")
            .assert("# edges\n\nMERGED[# Edges|Edges link nodes.]\n");
    }

    #[test]
    fn test_failed_topic_falls_back_to_raw_fragments() {
        let (temp, config) = setup(FailurePolicy::Raw);
        let model = Arc::new(ScriptedModel::new(|prompt: &str| {
            if document_of(prompt).contains("Edges") {
                Err(LlmError::Communication("timeout".to_string()))
            } else {
                Ok("merged walkers".to_string())
            }
        }));

        let report = run_merge(&config, model.clone()).unwrap();

        assert_eq!(model.calls(), 1 + 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].unit, "topic:edges");
        temp.child("out/2_merged/edges.txt")
            .assert("# edges\n\n# Edges\nEdges link nodes.\n");
    }

    #[test]
    fn test_failed_topic_is_dropped() {
        let (temp, config) = setup(FailurePolicy::Drop);
        let model = Arc::new(ScriptedModel::new(|prompt: &str| {
            if document_of(prompt).contains("Edges") {
                Err(LlmError::EmptyResponse)
            } else {
                Ok("merged walkers".to_string())
            }
        }));

        let report = run_merge(&config, model).unwrap();

        assert_eq!(report.failed, 1);
        assert!(!temp.child("out/2_merged/edges.txt").path().exists());
        let merged = merged_documents(&temp.path().join("out/2_merged")).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0, "walkers");
    }

    #[test]
    fn test_requires_extracted_topics() {
        let temp = TempDir::new().unwrap();
        let config = Config::builder()
            .source_dir(temp.path().join("docs"))
            .output_dir(temp.path().join("out"))
            .build()
            .unwrap();
        let model = Arc::new(ScriptedModel::new(|_: &str| Ok("x".to_string())));

        let result = run_merge(&config, model);

        assert!(matches!(result, Err(e) if e.is_precondition()));
    }
}
