//! Reduce the fonts embedded in an unpacked EPUB to the glyphs its text
//! actually uses.
//!
//! The pipeline resolves the `font-family` cascade of every markup document,
//! collects the rendered code points per fallback chain, allocates them to
//! the font resources behind each chain and then deletes, subsets or
//! reports every font. Bundle access and glyph subsetting are pluggable
//! through [`Bundle`] and [`FontSubsetter`].

#![cfg_attr(
    not(test),
    deny(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::panic_in_result_fn,
        clippy::todo,
        clippy::unimplemented
    )
)]

pub mod bundle;
pub mod cascade;
pub mod cmap;
#[cfg(feature = "cli")]
pub mod command;
pub mod coordinator;
pub mod coverage;
pub mod css;
pub mod error;
pub mod glyphs;
pub mod markup;
pub mod opf;
pub mod selector;
pub mod stylesheet;
pub mod subfont;

pub use bundle::{Bundle, MemoryBundle, Resource, ResourceId, ResourceKind};
pub use cascade::{resolve_document, ResolvedDocument};
pub use cmap::{load_font, FontContainer, FontFormat, FontResource};
#[cfg(feature = "cli")]
pub use command::CommandSubsetter;
pub use coordinator::{FontSubsetter, SubsetJob, SubsetOutput};
pub use coverage::{allocate, decide, CoverageResult, Decision, FontCatalog};
pub use error::{ErrorLimitContext, ErrorPhase, SubfontError};
pub use glyphs::GlyphDemand;
pub use markup::{Document, ElementId, MarkupLimits};
pub use opf::DirBundle;
pub use stylesheet::{FontFamilyDeclaration, SelectorRule, StylesheetIndex};
pub use subfont::{
    subset_fonts, Diagnostic, FontAction, FontLimits, SubfontOptions, DEFAULT_SAFETY_CODEPOINT,
};
