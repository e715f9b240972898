//! Font subsetting pipeline entry point and its options.

use core::fmt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rayon::prelude::*;

use crate::bundle::{basename, basename_key, resolve_relative, Bundle, Resource, ResourceKind};
use crate::cascade::resolve_document;
use crate::cmap::{load_font, FontResource};
use crate::coordinator::{execute, FontSubsetter};
use crate::coverage::{allocate, decide, Decision, FontCatalog};
use crate::error::{ErrorPhase, SubfontError};
use crate::glyphs::GlyphDemand;
use crate::markup::{Document, MarkupLimits};
use crate::stylesheet::{FontFamilyDeclaration, StylesheetIndex};

/// U+7684, kept in every subset when the font maps it.
pub const DEFAULT_SAFETY_CODEPOINT: u32 = 0x7684;

/// Font loading limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FontLimits {
    /// Max faces accepted in one collection.
    pub max_faces: usize,
    /// Max bytes for one font resource; larger fonts are treated as unreadable.
    pub max_bytes_per_font: usize,
}

impl Default for FontLimits {
    fn default() -> Self {
        Self {
            max_faces: 64,
            max_bytes_per_font: 64 * 1024 * 1024,
        }
    }
}

/// Options for [`subset_fonts`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubfontOptions {
    /// Font loading limits.
    pub limits: FontLimits,
    /// Markup tree limits.
    pub markup: MarkupLimits,
    /// Worker threads for parsing and subsetting; 0 means one per CPU.
    pub max_workers: usize,
    /// Extra code point kept in every subset when the font maps it.
    pub safety_codepoint: u32,
    /// Compute diagnostics without touching the bundle.
    pub dry_run: bool,
    /// Max characters listed in a missing-glyph sample.
    pub missing_sample_chars: usize,
}

impl Default for SubfontOptions {
    fn default() -> Self {
        Self {
            limits: FontLimits::default(),
            markup: MarkupLimits::default(),
            max_workers: 0,
            safety_codepoint: DEFAULT_SAFETY_CODEPOINT,
            dry_run: false,
            missing_sample_chars: 80,
        }
    }
}

/// What happened to a font resource (or a chain).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FontAction {
    /// Removed from the bundle.
    Deleted,
    /// Reduced to its retained code points.
    Subset,
    /// Left unmodified; some demanded glyphs are unavailable.
    Reported,
    /// Left unmodified; the font could not be read.
    Unreadable,
    /// Left unmodified; the subsetting job failed.
    SubsetFailed,
    /// A fallback chain with demand but no backing font resource.
    UnbackedChain,
}

impl FontAction {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::Subset => "subset",
            Self::Reported => "reported",
            Self::Unreadable => "unreadable",
            Self::SubsetFailed => "subset-failed",
            Self::UnbackedChain => "unbacked-chain",
        }
    }
}

impl fmt::Display for FontAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for one font resource or unbacked chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Font basename, or the comma-joined chain for unbacked chains.
    pub font_name: String,
    /// Action taken.
    pub action: FontAction,
    /// Number of code points kept (subset) or supplied (reported).
    pub retained_count: Option<usize>,
    /// Number of demanded code points nobody could supply.
    pub missing_count: Option<usize>,
    /// Up to `missing_sample_chars` of the missing characters.
    pub missing_sample: Option<String>,
    /// Extra context: a new basename after a rename, or a failure reason.
    pub detail: Option<Box<str>>,
}

impl Diagnostic {
    /// Diagnostic with no counts.
    pub fn new(font_name: impl Into<String>, action: FontAction) -> Self {
        Self {
            font_name: font_name.into(),
            action,
            retained_count: None,
            missing_count: None,
            missing_sample: None,
            detail: None,
        }
    }

    /// Attach a retained count.
    pub fn with_retained(mut self, count: usize) -> Self {
        self.retained_count = Some(count);
        self
    }

    /// Attach the missing count and a character sample.
    pub fn with_missing(mut self, missing: &BTreeSet<u32>, sample_chars: usize) -> Self {
        self.missing_count = Some(missing.len());
        self.missing_sample = Some(
            missing
                .iter()
                .filter_map(|cp| char::from_u32(*cp))
                .take(sample_chars)
                .collect(),
        );
        self
    }

    /// Attach free-form context.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into().into_boxed_str());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.font_name)?;
        if let Some(count) = self.retained_count {
            write!(f, " retained={}", count)?;
        }
        if let Some(count) = self.missing_count {
            write!(f, " missing={}", count)?;
        }
        if let Some(sample) = self.missing_sample.as_deref() {
            write!(f, " sample={:?}", sample)?;
        }
        if let Some(detail) = self.detail.as_deref() {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Work out which glyphs every font must keep, then delete, subset or
/// report each font resource of `bundle`.
pub fn subset_fonts<B: Bundle + ?Sized>(
    bundle: &mut B,
    subsetter: &dyn FontSubsetter,
    options: &SubfontOptions,
) -> Result<Vec<Diagnostic>, SubfontError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.max_workers)
        .build()
        .map_err(|err| {
            SubfontError::new(ErrorPhase::Subset, "WORKER_POOL", err.to_string())
        })?;

    let font_resources = bundle.iter_by_kind(&[ResourceKind::Font]);
    if font_resources.is_empty() {
        log::info!("bundle has no font resources");
        return Ok(Vec::new());
    }
    let font_lookup: HashMap<String, Resource> = font_resources
        .iter()
        .map(|resource| (basename_key(&resource.href), resource.clone()))
        .collect();

    let mut font_bytes = Vec::with_capacity(font_resources.len());
    for resource in &font_resources {
        font_bytes.push((resource.clone(), bundle.read_binary(resource)?));
    }
    let fonts: Vec<FontResource> = pool.install(|| {
        font_bytes
            .into_par_iter()
            .map(|(resource, bytes)| load_font(resource, &bytes, &options.limits))
            .collect()
    });

    let mut sheets = SheetLibrary::default();
    for resource in bundle.iter_by_kind(&[ResourceKind::Stylesheet]) {
        let text = bundle.read_text(&resource)?;
        sheets.sources.insert(basename_key(&resource.href), (resource, text));
    }
    sheets.index_all(&font_lookup);

    let mut documents = Vec::new();
    for resource in bundle.iter_by_kind(&[ResourceKind::Markup]) {
        let text = bundle.read_text(&resource)?;
        if text.len() > options.markup.max_document_bytes {
            return Err(SubfontError::new(
                ErrorPhase::Markup,
                "MARKUP_TOO_LARGE",
                "markup document exceeds size limit",
            )
            .with_path(resource.href.clone())
            .with_limit(
                "max_document_bytes",
                text.len(),
                options.markup.max_document_bytes,
            ));
        }
        documents.push((resource, text));
    }

    let per_document: Vec<(GlyphDemand, Vec<FontFamilyDeclaration>)> = pool.install(|| {
        documents
            .par_iter()
            .map(|(resource, text)| demand_for_document(resource, text, &sheets, &font_lookup, options))
            .collect()
    });

    let mut catalog = FontCatalog::new(fonts);
    for index in sheets.indexed_in_bundle_order() {
        for declaration in &index.font_faces {
            catalog.declare(declaration);
        }
    }
    let mut demand = GlyphDemand::new();
    for (doc_demand, inline_faces) in per_document {
        demand.merge(doc_demand);
        for declaration in &inline_faces {
            catalog.declare(declaration);
        }
    }
    log::info!(
        "{} documents, {} fallback chains, {} fonts",
        documents.len(),
        demand.len(),
        catalog.fonts().len()
    );

    let allocation = pool.install(|| allocate(&catalog, &demand));
    let decisions: Vec<Decision> = catalog
        .fonts()
        .iter()
        .enumerate()
        .map(|(idx, font)| decide(font, &allocation.coverage(idx), options.safety_codepoint))
        .collect();

    let mut diagnostics = if options.dry_run {
        dry_run_diagnostics(&catalog, &decisions, options)
    } else {
        execute(bundle, &catalog, &decisions, subsetter, &pool, options)?
    };
    for (chain, count) in &allocation.unbacked {
        log::info!("chain [{}] has no embedded font", chain.join(", "));
        diagnostics.push(
            Diagnostic::new(chain.join(", "), FontAction::UnbackedChain).with_detail(format!(
                "{} code points rendered with system fonts",
                count
            )),
        );
    }
    Ok(diagnostics)
}

fn demand_for_document(
    resource: &Resource,
    text: &str,
    sheets: &SheetLibrary,
    font_lookup: &HashMap<String, Resource>,
    options: &SubfontOptions,
) -> (GlyphDemand, Vec<FontFamilyDeclaration>) {
    let doc = Document::parse(&resource.href, text, options.markup);
    let mut applied: Vec<Arc<StylesheetIndex>> = Vec::with_capacity(doc.stylesheet_links.len());
    for href in &doc.stylesheet_links {
        let target = resolve_relative(&resource.href, href);
        match sheets.get(&basename_key(&target)) {
            Some(index) => applied.push(index),
            None => log::warn!("{}: stylesheet {} not in bundle", resource.href, href),
        }
    }
    let mut inline_faces = Vec::new();
    for block in &doc.style_blocks {
        let index = StylesheetIndex::parse(
            block,
            |href| sheets.get(&basename_key(&resolve_relative(&resource.href, href))),
            |name| font_lookup.get(&basename_key(name)).cloned(),
        );
        inline_faces.extend(index.font_faces.iter().cloned());
        applied.push(Arc::new(index));
    }
    let resolved = resolve_document(&doc, &applied);
    let demand = GlyphDemand::from_document(&doc, &resolved);
    log::debug!(
        "{}: {} elements, {} sheets, {} chains",
        resource.href,
        doc.len(),
        applied.len(),
        demand.len()
    );
    (demand, inline_faces)
}

/// Indexed stylesheets keyed by lowercase basename.
#[derive(Default)]
struct SheetLibrary {
    sources: HashMap<String, (Resource, String)>,
    indexed: HashMap<String, Arc<StylesheetIndex>>,
}

impl SheetLibrary {
    fn get(&self, key: &str) -> Option<Arc<StylesheetIndex>> {
        self.indexed.get(key).cloned()
    }

    /// Index every source in bundle order. A sheet reached again through
    /// an `@import` cycle contributes nothing on the second visit.
    fn index_all(&mut self, font_lookup: &HashMap<String, Resource>) {
        let mut keys: Vec<(&String, &Resource)> = self
            .sources
            .iter()
            .map(|(key, (resource, _))| (key, resource))
            .collect();
        keys.sort_by_key(|(_, resource)| resource.id);
        let keys: Vec<String> = keys.into_iter().map(|(key, _)| key.clone()).collect();
        let mut stack = Vec::new();
        for key in keys {
            self.index_one(&key, &mut stack, font_lookup);
        }
    }

    fn index_one(
        &mut self,
        key: &str,
        stack: &mut Vec<String>,
        font_lookup: &HashMap<String, Resource>,
    ) -> Option<Arc<StylesheetIndex>> {
        if let Some(done) = self.indexed.get(key) {
            return Some(Arc::clone(done));
        }
        if stack.iter().any(|open| open == key) {
            log::warn!("@import cycle through {}", key);
            return None;
        }
        let (resource, text) = self.sources.get(key).cloned()?;
        stack.push(key.to_string());
        let index = StylesheetIndex::parse(
            &text,
            |href| {
                let target = resolve_relative(&resource.href, href);
                self.index_one(&basename_key(&target), stack, font_lookup)
            },
            |name| font_lookup.get(&basename_key(name)).cloned(),
        );
        stack.pop();
        log::debug!(
            "stylesheet {}: {} font faces, {} font-family rules",
            resource.href,
            index.font_faces.len(),
            index.rules.len()
        );
        let index = Arc::new(index);
        self.indexed.insert(key.to_string(), Arc::clone(&index));
        Some(index)
    }

    fn indexed_in_bundle_order(&self) -> Vec<Arc<StylesheetIndex>> {
        let mut entries: Vec<(&Resource, Arc<StylesheetIndex>)> = self
            .indexed
            .iter()
            .filter_map(|(key, index)| {
                self.sources
                    .get(key)
                    .map(|(resource, _)| (resource, Arc::clone(index)))
            })
            .collect();
        entries.sort_by_key(|(resource, _)| resource.id);
        entries.into_iter().map(|(_, index)| index).collect()
    }
}

fn dry_run_diagnostics(
    catalog: &FontCatalog,
    decisions: &[Decision],
    options: &SubfontOptions,
) -> Vec<Diagnostic> {
    catalog
        .fonts()
        .iter()
        .zip(decisions)
        .map(|(font, decision)| plan_diagnostic(font, decision, options))
        .collect()
}

/// Diagnostic for a decision before anything is executed.
pub(crate) fn plan_diagnostic(
    font: &FontResource,
    decision: &Decision,
    options: &SubfontOptions,
) -> Diagnostic {
    let name = basename(&font.resource.href);
    match decision {
        Decision::KeepUnreadable => Diagnostic::new(name, FontAction::Unreadable)
            .with_detail(font.unreadable.as_deref().unwrap_or("unreadable")),
        Decision::Delete => Diagnostic::new(name, FontAction::Deleted),
        Decision::Report { missing } => Diagnostic::new(name, FontAction::Reported)
            .with_missing(missing, options.missing_sample_chars),
        Decision::Subset { codepoints } => {
            Diagnostic::new(name, FontAction::Subset).with_retained(codepoints.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_have_stable_names() {
        assert_eq!(FontAction::SubsetFailed.to_string(), "subset-failed");
        assert_eq!(FontAction::UnbackedChain.as_str(), "unbacked-chain");
    }

    #[test]
    fn missing_sample_is_truncated() {
        let missing: BTreeSet<u32> = "abcdef".chars().map(u32::from).collect();
        let diag = Diagnostic::new("a.ttf", FontAction::Reported).with_missing(&missing, 3);
        assert_eq!(diag.missing_count, Some(6));
        assert_eq!(diag.missing_sample.as_deref(), Some("abc"));
        assert_eq!(
            diag.to_string(),
            "reported: a.ttf missing=6 sample=\"abc\""
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = SubfontOptions::default();
        assert_eq!(options.safety_codepoint, 0x7684);
        assert_eq!(options.missing_sample_chars, 80);
        assert!(!options.dry_run);
    }
}
