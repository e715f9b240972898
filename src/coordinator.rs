//! Runs subsetting jobs and applies allocation decisions to the bundle.
//!
//! Jobs run on a bounded worker pool and only read shared data. The bundle
//! is mutated after every job has finished; renamed fonts get their
//! references rewritten in one pass at the end.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::{self, AssertUnwindSafe};

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::bundle::{basename, basename_key, Bundle, ResourceKind};
use crate::cmap::{detect_format, is_cff, sfnt_source, FontContainer, FontFormat};
use crate::coverage::{Decision, FontCatalog};
use crate::error::{ErrorPhase, SubfontError};
use crate::subfont::{plan_diagnostic, Diagnostic, FontAction, SubfontOptions};

/// One font to reduce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetJob {
    /// Bundle path of the source font, for logs.
    pub font_name: String,
    /// Source sfnt or collection bytes (WOFF already inflated).
    pub font: Vec<u8>,
    /// Face to keep when `container` is a collection.
    pub face_index: u32,
    /// Layout of `font`.
    pub container: FontContainer,
    /// Code points to keep.
    pub codepoints: BTreeSet<u32>,
}

/// Result of a successful job: one single-face sfnt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetOutput {
    /// Reduced font bytes.
    pub data: Vec<u8>,
}

/// Glyph-subsetting routine.
pub trait FontSubsetter: Sync {
    /// Reduce `job.font` to `job.codepoints`.
    fn subset(&self, job: &SubsetJob) -> Result<SubsetOutput, SubfontError>;
}

impl<F> FontSubsetter for F
where
    F: Fn(&SubsetJob) -> Result<SubsetOutput, SubfontError> + Sync,
{
    fn subset(&self, job: &SubsetJob) -> Result<SubsetOutput, SubfontError> {
        self(job)
    }
}

/// Run every job on `pool`. A failing or panicking job yields an error in
/// its slot and never affects its siblings.
pub fn run_jobs(
    jobs: &[SubsetJob],
    subsetter: &dyn FontSubsetter,
    pool: &ThreadPool,
) -> Vec<Result<SubsetOutput, SubfontError>> {
    pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| subsetter.subset(job)))
                    .unwrap_or_else(|_| {
                        Err(SubfontError::new(
                            ErrorPhase::Subset,
                            "SUBSET_FAILED",
                            "subsetter panicked",
                        ))
                    });
                outcome.and_then(|output| validate_output(job, output))
            })
            .collect()
    })
}

fn validate_output(job: &SubsetJob, output: SubsetOutput) -> Result<SubsetOutput, SubfontError> {
    if detect_format(&output.data) != Some(FontFormat::Sfnt) {
        return Err(SubfontError::new(
            ErrorPhase::Subset,
            "SUBSET_FAILED",
            "subsetter output is not a single-face sfnt",
        )
        .with_path(job.font_name.clone()));
    }
    Ok(output)
}

/// Execute `decisions` (one per catalog font) against `bundle`.
pub fn execute<B: Bundle + ?Sized>(
    bundle: &mut B,
    catalog: &FontCatalog,
    decisions: &[Decision],
    subsetter: &dyn FontSubsetter,
    pool: &ThreadPool,
    options: &SubfontOptions,
) -> Result<Vec<Diagnostic>, SubfontError> {
    let fonts = catalog.fonts();

    let mut jobs = Vec::new();
    let mut job_of: BTreeMap<usize, usize> = BTreeMap::new();
    let mut prep_failures: BTreeMap<usize, SubfontError> = BTreeMap::new();
    for (idx, (font, decision)) in fonts.iter().zip(decisions).enumerate() {
        let Decision::Subset { codepoints } = decision else {
            continue;
        };
        let source = bundle
            .read_binary(&font.resource)
            .and_then(|bytes| sfnt_source(&bytes));
        match source {
            Ok(font_bytes) => {
                job_of.insert(idx, jobs.len());
                jobs.push(SubsetJob {
                    font_name: font.resource.href.clone(),
                    font: font_bytes,
                    face_index: 0,
                    container: font.container,
                    codepoints: codepoints.clone(),
                });
            }
            Err(err) => {
                prep_failures.insert(idx, err);
            }
        }
    }

    log::info!("running {} subset jobs", jobs.len());
    let mut outcomes = JobOutcomes {
        results: run_jobs(&jobs, subsetter, pool).into_iter().map(Some).collect(),
        job_of,
        prep_failures,
    };

    let mut diagnostics = Vec::with_capacity(fonts.len());
    let mut renames: BTreeMap<String, String> = BTreeMap::new();
    let applied = apply_decisions(
        bundle,
        catalog,
        decisions,
        &mut outcomes,
        options,
        &mut diagnostics,
        &mut renames,
    );
    // Renames already applied must be rewritten even when a later step failed.
    let rewritten = if renames.is_empty() {
        Ok(())
    } else {
        bundle.rewrite_references(&[ResourceKind::Markup, ResourceKind::Stylesheet], &renames)
    };
    applied?;
    rewritten?;
    Ok(diagnostics)
}

/// Job results keyed by catalog index.
struct JobOutcomes {
    results: Vec<Option<Result<SubsetOutput, SubfontError>>>,
    job_of: BTreeMap<usize, usize>,
    prep_failures: BTreeMap<usize, SubfontError>,
}

impl JobOutcomes {
    fn take(&mut self, font_idx: usize) -> Option<Result<SubsetOutput, SubfontError>> {
        match self.job_of.get(&font_idx) {
            Some(&job) => self.results.get_mut(job).and_then(Option::take),
            None => self.prep_failures.remove(&font_idx).map(Err),
        }
    }
}

/// Apply every decision in catalog order. Successful renames are recorded
/// in `renames` as they happen so the caller can rewrite them on failure.
fn apply_decisions<B: Bundle + ?Sized>(
    bundle: &mut B,
    catalog: &FontCatalog,
    decisions: &[Decision],
    outcomes: &mut JobOutcomes,
    options: &SubfontOptions,
    diagnostics: &mut Vec<Diagnostic>,
    renames: &mut BTreeMap<String, String>,
) -> Result<(), SubfontError> {
    let mut reserved: HashSet<String> = HashSet::new();
    for (idx, (font, decision)) in catalog.fonts().iter().zip(decisions).enumerate() {
        let name = basename(&font.resource.href).to_string();
        match decision {
            Decision::Delete => {
                bundle.delete_resource(&font.resource)?;
                log::info!("deleted unused font {}", font.resource.href);
                diagnostics.push(plan_diagnostic(font, decision, options));
            }
            Decision::KeepUnreadable => {
                diagnostics.push(plan_diagnostic(font, decision, options));
            }
            Decision::Report { missing } => {
                log::info!(
                    "font {} lacks {} demanded glyphs; left unmodified",
                    font.resource.href,
                    missing.len()
                );
                diagnostics.push(plan_diagnostic(font, decision, options));
            }
            Decision::Subset { codepoints } => {
                let output = match outcomes.take(idx) {
                    Some(Ok(output)) => output,
                    Some(Err(err)) => {
                        log::warn!("subsetting {} failed: {}", font.resource.href, err);
                        diagnostics.push(
                            Diagnostic::new(name, FontAction::SubsetFailed)
                                .with_retained(codepoints.len())
                                .with_detail(err.to_string()),
                        );
                        continue;
                    }
                    None => {
                        diagnostics.push(
                            Diagnostic::new(name, FontAction::SubsetFailed)
                                .with_detail("no job outcome"),
                        );
                        continue;
                    }
                };

                let mut diagnostic =
                    Diagnostic::new(name.clone(), FontAction::Subset).with_retained(codepoints.len());
                if font.changes_container() {
                    let new_name = unique_basename(&*bundle, &name, &output.data, &reserved);
                    reserved.insert(basename_key(&new_name));
                    bundle.add_resource(&new_name, &output.data, true)?;
                    renames.insert(name, new_name.clone());
                    bundle.delete_resource(&font.resource)?;
                    log::info!(
                        "subset {} into {} ({} code points)",
                        font.resource.href,
                        new_name,
                        codepoints.len()
                    );
                    diagnostic = diagnostic.with_detail(format!("renamed to {}", new_name));
                } else {
                    bundle.write_binary(&font.resource, &output.data)?;
                    log::info!(
                        "subset {} in place ({} code points)",
                        font.resource.href,
                        codepoints.len()
                    );
                }
                diagnostics.push(diagnostic);
            }
        }
    }
    Ok(())
}

/// `<stem>.ttf` (`.otf` for CFF output), with `_` appended to the stem
/// until no live resource or earlier rename uses the name.
fn unique_basename<B: Bundle + ?Sized>(
    bundle: &B,
    old_name: &str,
    output: &[u8],
    reserved: &HashSet<String>,
) -> String {
    let mut stem = old_name
        .rsplit_once('.')
        .map_or(old_name, |(stem, _)| stem)
        .to_string();
    let ext = if is_cff(output) { "otf" } else { "ttf" };
    loop {
        let candidate = format!("{}.{}", stem, ext);
        if bundle.lookup_by_basename(&candidate).is_none()
            && !reserved.contains(&basename_key(&candidate))
        {
            return candidate;
        }
        stem.push('_');
    }
}
