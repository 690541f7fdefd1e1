use crate::{
    artifact::{reset_dir, resolve_path, write_json},
    compress::Compressor,
    condense::Condenser,
    config::Config,
    error::{Error, Result},
    extract::{CorpusStats, Extractor},
    llm::LanguageModel,
    merge::TopicMerger,
    reduce::{HierarchicalReducer, PassSummary},
    release::{ReleaseEntry, ReleaseManager},
    report::{serialize_secs, Stage, StageReport},
    template::TemplateEngine,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Statistics collected during pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Corpus figures, present when extraction ran
    pub corpus: Option<CorpusStats>,

    /// One report per executed stage, in order
    pub stages: Vec<StageReport>,

    /// Reduction passes, present when the reduce stage ran
    pub reduction_passes: Vec<PassSummary>,

    /// Published release, present when the release stage ran
    pub release: Option<ReleaseEntry>,

    /// Total execution time
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,

    /// Output directory path
    pub output_directory: String,

    /// Local time the run finished
    pub generated_at: String,
}

impl PipelineStats {
    fn new(output_directory: String) -> Self {
        Self {
            corpus: None,
            stages: Vec::new(),
            reduction_passes: Vec::new(),
            release: None,
            duration: Duration::ZERO,
            output_directory,
            generated_at: String::new(),
        }
    }

    /// Returns the report of `stage`, if it ran.
    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }

    /// Failed units across all stages.
    #[must_use]
    pub fn total_failures(&self) -> usize {
        self.stages.iter().map(|report| report.failed).sum()
    }

    /// Final document tokens over corpus tokens, when both stages ran.
    #[must_use]
    pub fn overall_compression_ratio(&self) -> Option<f64> {
        let corpus = self.corpus.as_ref()?;
        let final_tokens = self.stage(Stage::Compress)?.condensed_tokens;
        Some(crate::token::compression_ratio(corpus.tokens, final_tokens))
    }

    /// Writes the statistics as `run_report_<timestamp>.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be serialized or written.
    pub fn write_report(&self, dir: &Path) -> Result<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("run_report_{timestamp}.json"));
        write_json(&path, self)?;
        info!("Wrote run report to {}", path.display());
        Ok(path)
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║            Pipeline Execution Summary                 ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        if let Some(corpus) = &self.corpus {
            println!("║ Documents:            {:>8}                        ║", corpus.files);
            println!("║   - Sections kept:    {:>8} of {:<8}              ║", corpus.sections_kept, corpus.sections);
            println!("║   - Topics:           {:>8}                        ║", corpus.topics.len());
            println!("║ Corpus Tokens:        {:>8}                        ║", corpus.tokens);
            println!("║                                                       ║");
        }
        println!("║ Stages:                                               ║");
        for report in &self.stages {
            println!(
                "║   {}. {:<9} ok {:>5}  failed {:>4}  {:>8.2}s    ║",
                report.stage.number(),
                report.stage.name(),
                report.succeeded,
                report.failed,
                report.duration.as_secs_f64()
            );
        }
        if !self.reduction_passes.is_empty() {
            println!("║                                                       ║");
            println!("║ Reduction Passes:     {:>8}                        ║", self.reduction_passes.len());
            for pass in &self.reduction_passes {
                println!(
                    "║   - Pass {:<3} {:>6} -> {:<6} ({} failed)            ║",
                    pass.pass, pass.inputs, pass.groups, pass.failed
                );
            }
        }
        if let Some(compress) = self.stage(Stage::Compress) {
            println!("║                                                       ║");
            println!("║ Final Tokens:         {:>8}                        ║", compress.condensed_tokens);
        }
        if let Some(ratio) = self.overall_compression_ratio() {
            println!("║ Compression Ratio:    {:>8.4}                        ║", ratio);
        }
        if let Some(release) = &self.release {
            println!("║ Release:              {:>8}                        ║", release.version);
            println!("║   {}", release.path.display());
        }
        println!("║                                                       ║");
        println!("║ Failed Units:         {:>8}                        ║", self.total_failures());
        println!("║ Output Directory:                                     ║");
        println!("║   {}", self.output_directory);
        println!(
            "║ Total Time:           {:>8.2}s                       ║",
            self.duration.as_secs_f64()
        );
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Main pipeline orchestrator for condensing a documentation corpus.
pub struct Pipeline {
    config: Config,
    condenser: Condenser,
    templates: TemplateEngine,
    release: ReleaseManager,
    publish: bool,
}

impl Pipeline {
    /// Creates a new pipeline with the given configuration and model.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - An instruction template override cannot be loaded
    pub fn new(config: Config, model: Arc<dyn LanguageModel>) -> Result<Self> {
        config.validate()?;

        let condenser = Condenser::new(&config, model);
        let templates = TemplateEngine::new(&config.prompts)?;
        let release = ReleaseManager::new(&config.release);

        Ok(Self {
            config,
            condenser,
            templates,
            release,
            publish: true,
        })
    }

    /// Controls whether a full run ends with the release stage.
    #[must_use]
    pub fn with_release(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    /// Executes the complete pipeline and returns statistics.
    ///
    /// # Process
    ///
    /// 1. **Extract**: Splits the corpus into topic fragments
    /// 2. **Merge**: Condenses each topic into one section
    /// 3. **Reduce**: Tree-reduces the sections into one document
    /// 4. **Compress**: Formats and minifies the document
    /// 5. **Release**: Publishes the next versioned copy
    ///
    /// The output directory is deleted first, so every run starts clean. The run
    /// refuses to start when that wipe would reach the source directory or the
    /// release directory.
    ///
    /// # Errors
    ///
    /// Returns an error if any stage fails fatally. Failed units inside a stage
    /// are reported in the statistics instead.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llmdocs::{Config, HttpModel, Pipeline};
    /// use std::sync::Arc;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::load("config.yaml".as_ref())?;
    /// let model = Arc::new(HttpModel::from_config(&config.llm)?);
    ///
    /// let stats = Pipeline::new(config, model)?.run()?;
    /// stats.print_summary();
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self), fields(source_dir = %self.config.source_dir.display()))]
    pub fn run(&self) -> Result<PipelineStats> {
        let start_time = Instant::now();
        info!("Starting pipeline execution");

        self.check_wipe_target()?;
        reset_dir(&self.config.output_dir)?;

        let mut stats = PipelineStats::new(self.config.output_dir.display().to_string());
        for stage in Stage::ALL {
            if stage == Stage::Release && !self.publish {
                info!("Release disabled, skipping stage 5");
                continue;
            }
            self.execute(stage, &mut stats)?;
        }

        self.finish(&mut stats, start_time)?;
        info!(
            "✓ Pipeline completed in {:.2}s",
            stats.duration.as_secs_f64()
        );
        Ok(stats)
    }

    /// Refuses a full run whose output wipe would reach the corpus or the releases.
    ///
    /// Paths are compared after resolving symlinks and `..`, so `.` or
    /// `sub/../out` spellings cannot slip past.
    fn check_wipe_target(&self) -> Result<()> {
        let source_dir = &self.config.source_dir;
        let source = source_dir.canonicalize().map_err(|_| {
            Error::precondition(
                Stage::Extract.name(),
                format!("source directory '{}' does not exist", source_dir.display()),
            )
        })?;
        let output = resolve_path(&self.config.output_dir)?;
        let release = resolve_path(&self.config.release.dir)?;

        if source.starts_with(&output) {
            return Err(Error::config(format!(
                "output_dir '{}' contains source_dir and would be wiped",
                self.config.output_dir.display()
            )));
        }
        if output.starts_with(&source) {
            return Err(Error::config(format!(
                "output_dir '{}' lies inside source_dir '{}'",
                self.config.output_dir.display(),
                source_dir.display()
            )));
        }
        if release.starts_with(&output) {
            return Err(Error::config(format!(
                "release.dir '{}' lies inside output_dir and would be wiped",
                self.config.release.dir.display()
            )));
        }
        Ok(())
    }

    /// Executes one stage on the artifacts of a previous run.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the stage's inputs do not exist, or any
    /// fatal error of the stage itself.
    #[instrument(skip(self))]
    pub fn run_stage(&self, stage: Stage) -> Result<PipelineStats> {
        let start_time = Instant::now();

        let mut stats = PipelineStats::new(self.config.output_dir.display().to_string());
        self.execute(stage, &mut stats)?;

        self.finish(&mut stats, start_time)?;
        Ok(stats)
    }

    fn execute(&self, stage: Stage, stats: &mut PipelineStats) -> Result<()> {
        info!("Stage {}/{}: {}", stage.number(), Stage::ALL.len(), stage);

        let report = match stage {
            Stage::Extract => {
                let extraction = Extractor::new(&self.config)?.run()?;
                stats.corpus = Some(extraction.corpus);
                extraction.report
            }
            Stage::Merge => TopicMerger::new(&self.config, &self.condenser, &self.templates).run()?,
            Stage::Reduce => {
                let reduction =
                    HierarchicalReducer::new(&self.config, &self.condenser, &self.templates).run()?;
                stats.reduction_passes = reduction.passes;
                reduction.report
            }
            Stage::Compress => Compressor::new(&self.config, &self.condenser, &self.templates).run()?,
            Stage::Release => {
                let start = Instant::now();
                let entry = self.release.publish(&self.config.final_document())?;
                let mut report = StageReport::new(Stage::Release);
                report.record_success();
                report.duration = start.elapsed();
                stats.release = Some(entry);
                report
            }
        };

        if report.failed > 0 {
            warn!("✗ {}: {} units failed", stage, report.failed);
        } else {
            info!("✓ {} finished in {:.2}s", stage, report.duration.as_secs_f64());
        }
        stats.stages.push(report);
        Ok(())
    }

    fn finish(&self, stats: &mut PipelineStats, start_time: Instant) -> Result<()> {
        stats.duration = start_time.elapsed();
        stats.generated_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        stats.write_report(&self.config.metrics_dir())?;
        Ok(())
    }
}
