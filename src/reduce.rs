//! Tree reduction of the merged topic documents.
//!
//! Each pass partitions the working set into consecutive groups of at most
//! `ratio` documents and reduces every group with one call. Passes repeat until a
//! single document is left, so `N` inputs take `ceil(log_ratio(N))` passes.

use crate::{
    artifact::{read_text, reset_dir, write_atomic},
    condense::Condenser,
    config::{Config, FailurePolicy},
    error::{Error, Result},
    merge::merged_documents,
    pool::run_ordered,
    report::{Stage, StageReport},
    template::TemplateEngine,
};
use serde::Serialize;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// File name of the single document left after the last pass.
pub const UNIFIED_DOCUMENT: &str = "unified_doc.txt";

/// Splits `len` items into consecutive groups of at most `ratio`.
///
/// Every item lands in exactly one group and group order follows item order.
/// Only the last group may be smaller than `ratio`.
#[must_use]
pub fn plan_groups(len: usize, ratio: usize) -> Vec<Range<usize>> {
    let ratio = ratio.max(1);
    (0..len)
        .step_by(ratio)
        .map(|start| start..(start + ratio).min(len))
        .collect()
}

/// Number of passes needed to reduce `len` documents to one.
#[must_use]
pub fn pass_count(len: usize, ratio: usize) -> usize {
    if ratio < 2 {
        return 0;
    }
    let mut remaining = len;
    let mut passes = 0;
    while remaining > 1 {
        remaining = remaining.div_ceil(ratio);
        passes += 1;
    }
    passes
}

/// Summary of one reduction pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    /// 1-based pass number
    pub pass: usize,

    /// Documents entering the pass
    pub inputs: usize,

    /// Groups reduced, which is also the number of outputs
    pub groups: usize,

    /// Groups that failed
    pub failed: usize,
}

/// Result of stage 3.
#[derive(Debug, Clone)]
pub(crate) struct Reduction {
    pub(crate) report: StageReport,
    pub(crate) passes: Vec<PassSummary>,
}

/// Stage 3: reduces the topic documents to one unified document.
pub(crate) struct HierarchicalReducer<'a> {
    condenser: &'a Condenser,
    templates: &'a TemplateEngine,
    input_dir: PathBuf,
    output_dir: PathBuf,
    ratio: usize,
    workers: usize,
    policy: FailurePolicy,
}

impl<'a> HierarchicalReducer<'a> {
    pub(crate) fn new(config: &Config, condenser: &'a Condenser, templates: &'a TemplateEngine) -> Self {
        Self {
            condenser,
            templates,
            input_dir: config.merged_dir(),
            output_dir: config.hierarchical_dir(),
            ratio: config.ratio(),
            workers: config.hierarchical_merge.max_workers,
            policy: config.on_failure,
        }
    }

    /// Runs passes until one document is left and writes it as `unified_doc.txt`.
    ///
    /// Node outputs of pass `k` are saved as `pass_<k>/node_<i>.txt` once the
    /// whole pass has finished.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no merged documents or an artifact cannot be
    /// read or written.
    #[instrument(skip(self), fields(ratio = self.ratio))]
    pub(crate) fn run(&self) -> Result<Reduction> {
        let start = Instant::now();

        let inputs = if self.input_dir.is_dir() {
            merged_documents(&self.input_dir)?
        } else {
            Vec::new()
        };
        if inputs.is_empty() {
            return Err(Error::precondition(
                Stage::Reduce.name(),
                format!("no merged documents in '{}'", self.input_dir.display()),
            ));
        }

        reset_dir(&self.output_dir)?;

        let mut working = Vec::with_capacity(inputs.len());
        for (_, path) in &inputs {
            working.push(read_text(path)?);
        }

        let estimator = self.condenser.estimator();
        let mut report = StageReport::new(Stage::Reduce);
        report.original_tokens = working.iter().map(|doc| estimator.estimate(doc)).sum();

        info!(
            "Reducing {} documents with ratio {} ({} passes)",
            working.len(),
            self.ratio,
            pass_count(working.len(), self.ratio)
        );

        let mut passes = Vec::new();
        while working.len() > 1 {
            let pass = passes.len() + 1;
            let (outputs, summary) = self.run_pass(pass, &working, &mut report)?;
            working = outputs;
            passes.push(summary);
        }

        let unified = working.pop().unwrap_or_default();
        report.condensed_tokens = estimator.estimate(&unified);
        write_atomic(&self.output_dir.join(UNIFIED_DOCUMENT), &unified)?;

        report.duration = start.elapsed();
        info!(
            "Unified document after {} passes: {} -> {} tokens",
            passes.len(),
            report.original_tokens,
            report.condensed_tokens
        );

        Ok(Reduction { report, passes })
    }

    /// Reduces every group of one pass and returns the outputs in group order.
    fn run_pass(
        &self,
        pass: usize,
        working: &[String],
        report: &mut StageReport,
    ) -> Result<(Vec<String>, PassSummary)> {
        let groups = plan_groups(working.len(), self.ratio);
        let group_count = groups.len();
        debug!("Pass {}: {} documents in {} groups", pass, working.len(), group_count);

        let jobs: Vec<(String, usize)> = groups
            .into_iter()
            .map(|range| (working[range.clone()].join("\n\n"), range.len()))
            .collect();

        let results = run_ordered("reduce", self.workers, jobs, |index, (joined, size)| -> Result<(String, Option<String>)> {
            if joined.trim().is_empty() {
                return Ok((joined, None));
            }
            let instruction = self.templates.reduce(pass, index + 1, group_count, size)?;
            let result = self.condenser.reduce(&joined, &instruction);
            match result.content() {
                Some(content) => Ok((content.trim().to_string(), None)),
                None => Ok((joined, Some(result.error_message().to_string()))),
            }
        })?;

        let pass_dir = self.output_dir.join(format!("pass_{pass}"));
        let mut outputs = Vec::with_capacity(group_count);
        let mut failed = 0;

        for (index, result) in results.into_iter().enumerate() {
            let (mut output, error) = result?;
            let node = index + 1;
            match error {
                None => report.record_success(),
                Some(error) => {
                    warn!("Pass {} group {} failed: {}", pass, node, error);
                    report.record_failure(format!("pass {pass} group {node}"), error);
                    failed += 1;
                    if self.policy == FailurePolicy::Drop {
                        output = String::new();
                    }
                }
            }
            write_atomic(&pass_dir.join(format!("node_{node}.txt")), &output)?;
            outputs.push(output);
        }

        info!("Pass {} complete: {} -> {} documents ({} failed)", pass, working.len(), group_count, failed);

        let summary = PassSummary {
            pass,
            inputs: working.len(),
            groups: group_count,
            failed,
        };
        Ok((outputs, summary))
    }
}
