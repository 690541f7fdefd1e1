use crate::error::{Error, Result};
use crate::filter::FileFilter;
use crate::llm::Backoff;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_RATIO: usize = 4;
const DEFAULT_CHUNK_THRESHOLD: usize = 20_000;
const DEFAULT_CHUNK_SIZE: usize = 15_000;
const DEFAULT_MIN_SECTION_CHARS: usize = 50;
const DEFAULT_OUTPUT_FILE: &str = "llm_reference.txt";

/// What a failed merge unit contributes to the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep the unit's unmerged input
    #[default]
    Raw,
    /// Contribute nothing
    Drop,
}

/// Configuration for the condensation pipeline.
///
/// Usually loaded from YAML with [`Config::load`]; use [`Config::builder()`] to
/// construct one in code. Unknown keys are ignored and missing keys take defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Root of the documentation corpus
    pub source_dir: PathBuf,

    /// Root directory for all stage artifacts
    pub output_dir: PathBuf,

    /// Directory for run reports (defaults to `<output_dir>/metrics`)
    pub metrics_dir: Option<PathBuf>,

    /// Handling of failed topics, groups and formatting passes
    pub on_failure: FailurePolicy,

    /// Corpus parsing settings
    pub processing: ProcessingConfig,

    /// Known topics used to tag extracted sections
    pub topics: Vec<TopicConfig>,

    /// Stage 1 settings
    pub extraction: ExtractionConfig,

    /// Stage 2 settings
    pub merge: MergeConfig,

    /// Stage 3 settings
    pub hierarchical_merge: HierarchicalConfig,

    /// Stage 4 settings
    pub ultra_compression: CompressionConfig,

    /// Stage 5 settings
    pub release: ReleaseConfig,

    /// Model endpoint and retry settings
    pub llm: LlmConfig,

    /// Instruction template overrides
    pub prompts: PromptConfig,
}

/// Corpus parsing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Glob patterns of files to skip
    pub skip_patterns: Vec<String>,

    /// Sections shorter than this (trimmed) are not extracted
    pub min_section_chars: usize,

    /// Extraction worker count
    pub max_workers: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            skip_patterns: Vec::new(),
            min_section_chars: DEFAULT_MIN_SECTION_CHARS,
            max_workers: num_cpus::get(),
        }
    }
}

/// A topic sections can be tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Identifier used for directory and file names
    pub id: String,

    /// Human-readable name used in headings and prompts
    #[serde(default)]
    pub name: Option<String>,

    /// Case-insensitive keywords that signal the topic
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl TopicConfig {
    /// Creates a topic with a name and keywords.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
        }
    }

    /// Returns the display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Stage 1 settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Output directory (defaults to `<output_dir>/1_extracted`)
    pub output_dir: Option<PathBuf>,
}

/// Stage 2 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Output directory (defaults to `<output_dir>/2_merged`)
    pub output_dir: Option<PathBuf>,

    /// Branching factor, used when `hierarchical_merge.ratio` is unset
    pub ratio: Option<usize>,

    /// Concurrent topic merges
    ///
    /// Oversized topics open their own chunk pools on top of this, so model
    /// calls in flight can reach `max_workers` plus `chunk_workers` for every
    /// topic being chunked at once.
    pub max_workers: usize,

    /// Concurrent chunk reductions inside one oversized topic
    ///
    /// Each chunked topic gets its own pool of this size.
    pub chunk_workers: usize,

    /// Texts at or above this many chars are chunked
    pub chunk_threshold: usize,

    /// Target chunk size in chars
    pub chunk_size: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            ratio: None,
            max_workers: 16,
            chunk_workers: 8,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Stage 3 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchicalConfig {
    /// Output directory (defaults to `<output_dir>/3_hierarchical`)
    pub output_dir: Option<PathBuf>,

    /// Branching factor of the reduction tree
    pub ratio: Option<usize>,

    /// Concurrent group reductions per pass
    pub max_workers: usize,
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            ratio: None,
            max_workers: 8,
        }
    }
}

/// Stage 4 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Output directory (defaults to `<output_dir>/4_final`)
    pub output_dir: Option<PathBuf>,

    /// File name of the final document
    pub output_file: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            output_file: DEFAULT_OUTPUT_FILE.to_string(),
        }
    }
}

/// Stage 5 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Flat directory of versioned releases
    pub dir: PathBuf,

    /// File name prefix before the version number
    pub basename: String,

    /// File extension without the dot
    pub extension: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("release"),
            basename: "candidate".to_string(),
            extension: "txt".to_string(),
        }
    }
}

/// Model endpoint and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Output token cap per call
    pub max_output_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Per-request timeout
    pub timeout_secs: u64,

    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Initial delay between attempts
    pub retry_delay_ms: u64,

    /// Delay growth between attempts
    pub backoff: Backoff,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_output_tokens: 8_192,
            temperature: 0.2,
            timeout_secs: 300,
            max_retries: 2,
            retry_delay_ms: 1_000,
            backoff: Backoff::Exponential,
        }
    }
}

/// Optional instruction template files replacing the built-in ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Topic merge instruction
    pub merge: Option<PathBuf>,

    /// Hierarchical reduce instruction
    pub reduce: Option<PathBuf>,

    /// Final formatting instruction
    pub compress: Option<PathBuf>,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use llmdocs::Config;
    ///
    /// let config = Config::builder()
    ///     .source_dir("./docs")
    ///     .ratio(3)
    ///     .build()
    ///     .expect("valid configuration");
    /// assert_eq!(config.ratio(), 3);
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Loads and validates a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml_str(&raw)
    }

    /// Parses and validates a YAML configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(raw)?;
        config.fill_root_defaults();
        config.validate()?;
        Ok(config)
    }

    fn fill_root_defaults(&mut self) {
        if self.source_dir.as_os_str().is_empty() {
            self.source_dir = PathBuf::from("docs");
        }
        if self.output_dir.as_os_str().is_empty() {
            self.output_dir = PathBuf::from("output");
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The reduction ratio is below 2
    /// - A worker count or chunk size is zero
    /// - A skip pattern is not a valid glob
    /// - Topic ids or release naming are unusable as file names
    pub fn validate(&self) -> Result<()> {
        let ratio = self.ratio();
        if ratio < 2 {
            return Err(Error::config(format!(
                "reduction ratio must be at least 2, got {ratio}"
            )));
        }

        for (name, workers) in [
            ("processing.max_workers", self.processing.max_workers),
            ("merge.max_workers", self.merge.max_workers),
            ("merge.chunk_workers", self.merge.chunk_workers),
            ("hierarchical_merge.max_workers", self.hierarchical_merge.max_workers),
        ] {
            if workers == 0 {
                return Err(Error::config(format!("{name} must be greater than 0")));
            }
        }

        if self.merge.chunk_size == 0 || self.merge.chunk_threshold == 0 {
            return Err(Error::config(
                "merge.chunk_size and merge.chunk_threshold must be greater than 0",
            ));
        }

        if self.merge.chunk_size > self.merge.chunk_threshold {
            return Err(Error::config(format!(
                "merge.chunk_size ({}) must not exceed merge.chunk_threshold ({})",
                self.merge.chunk_size, self.merge.chunk_threshold
            )));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(Error::config(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            )));
        }

        FileFilter::new(&self.processing.skip_patterns)?;

        let mut seen = std::collections::HashSet::new();
        for topic in &self.topics {
            if !is_file_safe(&topic.id) {
                return Err(Error::config(format!(
                    "topic id '{}' must be non-empty and use only letters, digits, '-' or '_'",
                    topic.id
                )));
            }
            if !seen.insert(topic.id.as_str()) {
                return Err(Error::config(format!("duplicate topic id '{}'", topic.id)));
            }
        }

        let output_file = &self.ultra_compression.output_file;
        if output_file.is_empty() || output_file.contains(['/', '\\']) {
            return Err(Error::config(format!(
                "ultra_compression.output_file must be a plain file name, got '{output_file}'"
            )));
        }

        let release = &self.release;
        if release.basename.is_empty() || release.extension.is_empty() {
            return Err(Error::config(
                "release.basename and release.extension must not be empty",
            ));
        }
        if release.basename.ends_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::config(format!(
                "release.basename '{}' must not end with a digit",
                release.basename
            )));
        }

        Ok(())
    }

    /// Returns the branching factor of the reduction tree.
    #[must_use]
    pub fn ratio(&self) -> usize {
        self.hierarchical_merge
            .ratio
            .or(self.merge.ratio)
            .unwrap_or(DEFAULT_RATIO)
    }

    /// Stage 1 artifact directory.
    #[must_use]
    pub fn extraction_dir(&self) -> PathBuf {
        self.stage_dir(self.extraction.output_dir.as_ref(), "1_extracted")
    }

    /// Stage 2 artifact directory.
    #[must_use]
    pub fn merged_dir(&self) -> PathBuf {
        self.stage_dir(self.merge.output_dir.as_ref(), "2_merged")
    }

    /// Stage 3 artifact directory.
    #[must_use]
    pub fn hierarchical_dir(&self) -> PathBuf {
        self.stage_dir(self.hierarchical_merge.output_dir.as_ref(), "3_hierarchical")
    }

    /// Stage 4 artifact directory.
    #[must_use]
    pub fn final_dir(&self) -> PathBuf {
        self.stage_dir(self.ultra_compression.output_dir.as_ref(), "4_final")
    }

    /// Path of the final compressed document.
    #[must_use]
    pub fn final_document(&self) -> PathBuf {
        self.final_dir().join(&self.ultra_compression.output_file)
    }

    /// Directory for run reports.
    #[must_use]
    pub fn metrics_dir(&self) -> PathBuf {
        self.stage_dir(self.metrics_dir.as_ref(), "metrics")
    }

    /// Looks up a configured topic by id.
    #[must_use]
    pub fn topic(&self, id: &str) -> Option<&TopicConfig> {
        self.topics.iter().find(|t| t.id == id)
    }

    fn stage_dir(&self, configured: Option<&PathBuf>, default_name: &str) -> PathBuf {
        configured
            .cloned()
            .unwrap_or_else(|| self.output_dir.join(default_name))
    }
}

fn is_file_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    source_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    ratio: Option<usize>,
    workers: Option<usize>,
    skip_patterns: Vec<String>,
    topics: Vec<TopicConfig>,
    on_failure: Option<FailurePolicy>,
    chunk_threshold: Option<usize>,
    chunk_size: Option<usize>,
    min_section_chars: Option<usize>,
    output_file: Option<String>,
    release_dir: Option<PathBuf>,
    release_basename: Option<String>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

impl ConfigBuilder {
    /// Sets the corpus root directory.
    #[must_use]
    pub fn source_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(path.into());
        self
    }

    /// Sets the root directory for stage artifacts.
    #[must_use]
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Sets the reduction tree branching factor.
    #[must_use]
    pub fn ratio(mut self, ratio: usize) -> Self {
        self.ratio = Some(ratio);
        self
    }

    /// Sets every worker pool to the same size.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the skip glob patterns.
    #[must_use]
    pub fn skip_patterns(mut self, patterns: Vec<String>) -> Self {
        self.skip_patterns = patterns;
        self
    }

    /// Sets the known topics.
    #[must_use]
    pub fn topics(mut self, topics: Vec<TopicConfig>) -> Self {
        self.topics = topics;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    /// Sets the chunking threshold in chars.
    #[must_use]
    pub fn chunk_threshold(mut self, chars: usize) -> Self {
        self.chunk_threshold = Some(chars);
        self
    }

    /// Sets the target chunk size in chars.
    #[must_use]
    pub fn chunk_size(mut self, chars: usize) -> Self {
        self.chunk_size = Some(chars);
        self
    }

    /// Sets the minimum extracted section length.
    #[must_use]
    pub fn min_section_chars(mut self, chars: usize) -> Self {
        self.min_section_chars = Some(chars);
        self
    }

    /// Sets the final document file name.
    #[must_use]
    pub fn output_file(mut self, name: impl Into<String>) -> Self {
        self.output_file = Some(name.into());
        self
    }

    /// Sets the release directory.
    #[must_use]
    pub fn release_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.release_dir = Some(path.into());
        self
    }

    /// Sets the release file name prefix.
    #[must_use]
    pub fn release_basename(mut self, basename: impl Into<String>) -> Self {
        self.release_basename = Some(basename.into());
        self
    }

    /// Sets the retry budget of each model call.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the initial retry delay.
    #[must_use]
    pub fn retry_delay_ms(mut self, millis: u64) -> Self {
        self.retry_delay_ms = Some(millis);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let mut config = Config {
            source_dir: self.source_dir.unwrap_or_else(|| PathBuf::from("docs")),
            output_dir: self.output_dir.unwrap_or_else(|| PathBuf::from("output")),
            on_failure: self.on_failure.unwrap_or_default(),
            topics: self.topics,
            ..Config::default()
        };

        config.processing.skip_patterns = self.skip_patterns;
        if let Some(chars) = self.min_section_chars {
            config.processing.min_section_chars = chars;
        }
        if let Some(ratio) = self.ratio {
            config.hierarchical_merge.ratio = Some(ratio);
        }
        if let Some(workers) = self.workers {
            config.processing.max_workers = workers;
            config.merge.max_workers = workers;
            config.merge.chunk_workers = workers;
            config.hierarchical_merge.max_workers = workers;
        }
        if let Some(chars) = self.chunk_threshold {
            config.merge.chunk_threshold = chars;
        }
        if let Some(chars) = self.chunk_size {
            config.merge.chunk_size = chars;
        }
        if let Some(name) = self.output_file {
            config.ultra_compression.output_file = name;
        }
        if let Some(dir) = self.release_dir {
            config.release.dir = dir;
        }
        if let Some(basename) = self.release_basename {
            config.release.basename = basename;
        }
        if let Some(retries) = self.max_retries {
            config.llm.max_retries = retries;
        }
        if let Some(millis) = self.retry_delay_ms {
            config.llm.retry_delay_ms = millis;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::builder().build().unwrap();

        assert_eq!(config.ratio(), DEFAULT_RATIO);
        assert_eq!(config.merge.chunk_threshold, DEFAULT_CHUNK_THRESHOLD);
        assert_eq!(config.on_failure, FailurePolicy::Raw);
        assert_eq!(config.extraction_dir(), PathBuf::from("output/1_extracted"));
        assert_eq!(config.final_document(), PathBuf::from("output/4_final/llm_reference.txt"));
    }

    #[test]
    fn test_invalid_ratio() {
        assert!(Config::builder().ratio(1).build().unwrap_err().is_config());
        assert!(Config::builder().ratio(0).build().is_err());
    }

    #[test]
    fn test_invalid_skip_pattern() {
        let result = Config::builder()
            .skip_patterns(vec!["docs/[".to_string()])
            .build();

        assert!(matches!(result, Err(Error::InvalidPattern { .. })));
    }

    #[test]
    fn test_release_basename_cannot_end_in_digit() {
        assert!(Config::builder().release_basename("docs2").build().is_err());
    }

    #[test]
    fn test_duplicate_topic_ids() {
        let result = Config::builder()
            .topics(vec![
                TopicConfig::new("walkers", "Walkers", &["walker"]),
                TopicConfig::new("walkers", "Walkers again", &[]),
            ])
            .build();

        assert!(result.unwrap_err().to_string().contains("duplicate topic"));
    }

    #[test]
    fn test_yaml_recognized_and_unknown_keys() {
        let yaml = r"
source_dir: corpus
output_dir: out
processing:
  skip_patterns: ['*.html', 'index.md']
  section_workers: 4
merge:
  ratio: 3
  max_workers: 5
hierarchical_merge:
  max_workers: 2
ultra_compression:
  output_file: final.txt
llm:
  model: local-model
  backoff: fixed
something_else:
  nested: true
";
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.source_dir, PathBuf::from("corpus"));
        assert_eq!(config.processing.skip_patterns.len(), 2);
        assert_eq!(config.ratio(), 3);
        assert_eq!(config.merge.max_workers, 5);
        assert_eq!(config.hierarchical_merge.max_workers, 2);
        assert_eq!(config.merge.chunk_workers, 8);
        assert_eq!(config.final_document(), PathBuf::from("out/4_final/final.txt"));
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.backoff, Backoff::Fixed);
        assert_eq!(config.llm.max_retries, 2);
    }

    #[test]
    fn test_hierarchical_ratio_wins() {
        let yaml = "merge:\n  ratio: 3\nhierarchical_merge:\n  ratio: 6\n";
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.ratio(), 6);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();

        assert_eq!(config.source_dir, PathBuf::from("docs"));
        assert_eq!(config.metrics_dir(), PathBuf::from("output/metrics"));
        assert_eq!(config.release.basename, "candidate");
    }

    #[test]
    fn test_topics_from_yaml() {
        let yaml = r"
topics:
  - id: graph_ops
    name: Graph Operations
    keywords: [edge, node]
  - id: misc
on_failure: drop
";
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.on_failure, FailurePolicy::Drop);
        assert_eq!(config.topic("graph_ops").unwrap().display_name(), "Graph Operations");
        assert_eq!(config.topic("misc").unwrap().display_name(), "misc");
    }

    #[test]
    fn test_load_demo_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/config.yaml");
        let config = Config::load(&path).unwrap();

        assert_eq!(config.topics.len(), 2);
        assert_eq!(config.ratio(), 4);
        assert_eq!(config.llm.backoff, crate::llm::Backoff::Exponential);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/llmdocs.yaml")).unwrap_err();
        assert!(err.is_io());
    }
}
