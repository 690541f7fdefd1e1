use crate::{
    artifact::{read_text, reset_dir, write_atomic},
    config::{Config, TopicConfig},
    document::{has_doc_extension, is_likely_binary, DocFile, DocSection},
    error::{Error, Result},
    filter::FileFilter,
    pool::run_ordered,
    report::{Stage, StageReport},
    token::{CharEstimator, TokenEstimator},
};
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

const PROVENANCE_PREFIX: &str = "<!-- source: ";
const PROVENANCE_SUFFIX: &str = " -->";

/// Weight of a keyword hit in a section title, relative to one in the body.
const TITLE_WEIGHT: usize = 3;

/// Statistics about the parsed corpus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorpusStats {
    /// Documents parsed
    pub files: usize,

    /// Sections found
    pub sections: usize,

    /// Sections written into fragments
    pub sections_kept: usize,

    /// Lines across all documents
    pub lines: usize,

    /// Chars across all documents
    pub chars: usize,

    /// Estimated tokens across all documents
    pub tokens: usize,

    /// Fragment files written
    pub fragments: usize,

    /// Documents per category
    pub categories: BTreeMap<String, usize>,

    /// Fragments per topic
    pub topics: BTreeMap<String, usize>,
}

/// Result of stage 1.
#[derive(Debug, Clone)]
pub(crate) struct Extraction {
    pub(crate) report: StageReport,
    pub(crate) corpus: CorpusStats,
}

/// Tags sections with the best-matching configured topic.
pub(crate) struct TopicClassifier {
    topics: Vec<(String, Vec<String>)>,
}

impl TopicClassifier {
    pub(crate) fn new(topics: &[TopicConfig]) -> Self {
        Self {
            topics: topics
                .iter()
                .map(|topic| {
                    let keywords = topic
                        .keywords
                        .iter()
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect();
                    (topic.id.clone(), keywords)
                })
                .collect(),
        }
    }

    /// Returns the id of the highest-scoring topic, or `fallback` if none matches.
    ///
    /// Ties go to the topic configured first.
    pub(crate) fn classify<'a>(&'a self, section: &DocSection, fallback: &'a str) -> &'a str {
        let title = section.title.to_lowercase();
        let body = section.content.to_lowercase();

        let mut best: Option<(&str, usize)> = None;
        for (id, keywords) in &self.topics {
            let score: usize = keywords
                .iter()
                .map(|k| body.matches(k.as_str()).count() + (TITLE_WEIGHT - 1) * title.matches(k.as_str()).count())
                .sum();
            if score > 0 && best.is_none_or(|(_, top)| score > top) {
                best = Some((id, score));
            }
        }

        best.map_or(fallback, |(id, _)| id)
    }
}

/// A document selected for extraction.
#[derive(Debug, Clone)]
struct SourceFile {
    path: PathBuf,
    relative_path: String,
    slug: String,
}

/// What one document contributed.
#[derive(Debug, Default)]
struct FileExtraction {
    category: String,
    sections: usize,
    sections_kept: usize,
    lines: usize,
    chars: usize,
    tokens: usize,
    fragment_tokens: usize,
    topics: Vec<String>,
}

/// Stage 1: splits every source document into topic-tagged fragments.
pub(crate) struct Extractor {
    source_dir: PathBuf,
    output_dir: PathBuf,
    filter: FileFilter,
    classifier: TopicClassifier,
    min_section_chars: usize,
    workers: usize,
    estimator: Arc<dyn TokenEstimator>,
}

impl Extractor {
    /// Creates an extractor from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a skip pattern does not compile.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            source_dir: config.source_dir.clone(),
            output_dir: config.extraction_dir(),
            filter: FileFilter::new(&config.processing.skip_patterns)?,
            classifier: TopicClassifier::new(&config.topics),
            min_section_chars: config.processing.min_section_chars,
            workers: config.processing.max_workers,
            estimator: CharEstimator::shared(),
        })
    }

    /// Writes `<output>/<topic_id>/<file_slug>.md` for every document and topic.
    ///
    /// A document that cannot be read or parsed is recorded in the failure log
    /// and the others continue.
    ///
    /// # Errors
    ///
    /// Returns an error if the source directory is missing, the output cannot be
    /// written, or no fragment was produced at all.
    #[instrument(skip(self), fields(source_dir = %self.source_dir.display()))]
    pub(crate) fn run(&self) -> Result<Extraction> {
        let start = Instant::now();

        if !self.source_dir.is_dir() {
            return Err(Error::precondition(
                Stage::Extract.name(),
                format!("source directory '{}' does not exist", self.source_dir.display()),
            ));
        }

        let mut report = StageReport::new(Stage::Extract);
        let sources = self.discover(&mut report);
        debug!("Found {} documents", sources.len());

        reset_dir(&self.output_dir)?;

        let results = run_ordered("extract", self.workers, sources, |_, source| {
            let result = self.extract_file(&source);
            (source.relative_path, result)
        })?;

        let mut corpus = CorpusStats::default();
        for (relative_path, result) in results {
            match result {
                Ok(file) => {
                    report.record_success();
                    report.original_tokens += file.tokens;
                    report.condensed_tokens += file.fragment_tokens;
                    corpus.add(file);
                }
                Err(e) => {
                    warn!("Failed to extract {}: {}", relative_path, e);
                    report.record_failure(relative_path, e.to_string());
                }
            }
        }

        if corpus.fragments == 0 {
            return Err(Error::no_documents(&self.source_dir));
        }

        report.duration = start.elapsed();
        info!(
            "Extracted {} fragments in {} topics from {} documents ({} failed)",
            corpus.fragments,
            corpus.topics.len(),
            corpus.files,
            report.failed
        );

        Ok(Extraction { report, corpus })
    }

    /// Walks the source tree and picks the documentation files to extract.
    fn discover(&self, report: &mut StageReport) -> Vec<SourceFile> {
        let walker = WalkBuilder::new(&self.source_dir)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .hidden(true)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        let mut sources = Vec::new();
        let mut slugs = HashSet::new();

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Walk error: {}", e);
                    report.record_failure(self.source_dir.display().to_string(), e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }

            let path = entry.path();
            let relative = pathdiff::diff_paths(path, &self.source_dir)
                .unwrap_or_else(|| path.to_path_buf());
            if !self.filter.should_process(&relative) {
                trace!("Skipping {} (pattern)", relative.display());
                continue;
            }
            if !has_doc_extension(path) {
                trace!("Skipping {} (not documentation)", relative.display());
                continue;
            }

            let relative_path = relative.to_string_lossy().replace('\\', "/");
            let slug = unique_slug(&relative_path, &mut slugs);
            sources.push(SourceFile {
                path: path.to_path_buf(),
                relative_path,
                slug,
            });
        }

        sources.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        sources
    }

    fn extract_file(&self, source: &SourceFile) -> Result<FileExtraction> {
        if is_likely_binary(&source.path)? {
            return Err(Error::invalid_utf8(&source.path));
        }

        let content = read_text(&source.path)?;
        let doc = DocFile::parse(&source.relative_path, &content);

        let mut file = FileExtraction {
            category: doc.category.clone(),
            sections: doc.sections.len(),
            lines: doc.total_lines,
            chars: doc.total_chars,
            tokens: self.estimator.estimate(&content),
            ..FileExtraction::default()
        };

        let mut by_topic: Vec<(&str, Vec<&str>)> = Vec::new();
        for section in &doc.sections {
            if section.content.trim().chars().count() < self.min_section_chars {
                trace!("{}: skipping short section '{}'", source.relative_path, section.title);
                continue;
            }
            let topic = self.classifier.classify(section, &doc.category);
            match by_topic.iter_mut().find(|(id, _)| *id == topic) {
                Some((_, sections)) => sections.push(section.content.trim_end()),
                None => by_topic.push((topic, vec![section.content.trim_end()])),
            }
            file.sections_kept += 1;
        }

        for (topic, sections) in by_topic {
            let fragment = format!(
                "{}\n\n{}\n",
                provenance_header(&source.relative_path, topic),
                sections.join("\n\n")
            );
            let path = self.output_dir.join(topic).join(format!("{}.md", source.slug));
            write_atomic(&path, &fragment)?;

            file.fragment_tokens += self.estimator.estimate(&fragment);
            file.topics.push(topic.to_string());
        }

        trace!(
            "{}: {} of {} sections into {} topics",
            source.relative_path,
            file.sections_kept,
            file.sections,
            file.topics.len()
        );
        Ok(file)
    }
}

impl CorpusStats {
    fn add(&mut self, file: FileExtraction) {
        self.files += 1;
        self.sections += file.sections;
        self.sections_kept += file.sections_kept;
        self.lines += file.lines;
        self.chars += file.chars;
        self.tokens += file.tokens;
        self.fragments += file.topics.len();
        *self.categories.entry(file.category).or_default() += 1;
        for topic in file.topics {
            *self.topics.entry(topic).or_default() += 1;
        }
    }
}

/// First line of every fragment file.
pub(crate) fn provenance_header(relative_path: &str, topic_id: &str) -> String {
    format!("{PROVENANCE_PREFIX}{relative_path} | topic: {topic_id}{PROVENANCE_SUFFIX}")
}

/// Removes provenance header lines from fragment text.
pub(crate) fn strip_provenance(fragment: &str) -> String {
    fragment
        .lines()
        .filter(|line| {
            let line = line.trim();
            !(line.starts_with(PROVENANCE_PREFIX) && line.ends_with(PROVENANCE_SUFFIX))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Builds a file-safe name from a relative path, unique within `taken`.
fn unique_slug(relative_path: &str, taken: &mut HashSet<String>) -> String {
    let without_ext = Path::new(relative_path)
        .with_extension("")
        .to_string_lossy()
        .replace('\\', "/");

    let base: String = without_ext
        .split('/')
        .map(|part| {
            part.chars()
                .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("__");

    let mut slug = base.clone();
    let mut n = 2;
    while !taken.insert(slug.clone()) {
        slug = format!("{base}_{n}");
        n += 1;
    }
    slug
}
