//! Per-stylesheet index of `@font-face` families and font-family rules.

use std::sync::Arc;

use crate::bundle::{basename, Resource};
use crate::css::{self, CssRule, Declaration};
use crate::selector::{self, ComplexSelector, IMPORTANT_BONUS};

/// Chain token that splices the parent's resolved chain.
pub const INHERIT: &str = "inherit";
/// Chain token treated like [`INHERIT`].
pub const UNSET: &str = "unset";
/// Chain token that contributes nothing.
pub const INITIAL: &str = "initial";

/// `@font-face` family with its candidate font resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FontFamilyDeclaration {
    /// Normalized family name.
    pub family_name: String,
    /// Resources referenced by `src: url(...)`, in source order.
    pub candidate_resources: Vec<Resource>,
}

/// One complex selector with the font-family it assigns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorRule {
    /// Selector text as written.
    pub selector_text: String,
    /// Parsed selector.
    pub selector: ComplexSelector,
    /// Normalized family names; CSS-wide keywords kept as literal tokens.
    pub fallback_chain: Vec<String>,
    /// Specificity score including the important bonus.
    pub priority: i32,
    /// Whether the declaration was `!important`.
    pub important: bool,
}

/// Font-relevant content of one stylesheet, imports included.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StylesheetIndex {
    /// `@font-face` declarations in discovery order.
    pub font_faces: Vec<FontFamilyDeclaration>,
    /// Font-family rules in discovery order, imported rules first.
    pub rules: Vec<SelectorRule>,
}

impl StylesheetIndex {
    /// Index `text`.
    ///
    /// `resolve_import` receives each `@import` href as written and returns
    /// the imported sheet's index, or `None` if it cannot be resolved (or is
    /// already on the import stack). `lookup_font` maps a `url()` basename to
    /// a bundle resource.
    pub fn parse<I, L>(text: &str, mut resolve_import: I, lookup_font: L) -> Self
    where
        I: FnMut(&str) -> Option<Arc<StylesheetIndex>>,
        L: Fn(&str) -> Option<Resource>,
    {
        let parsed = css::parse_stylesheet(text);
        let mut imported = StylesheetIndex::default();
        let mut own = StylesheetIndex::default();

        for rule in parsed.rules {
            match rule {
                CssRule::Import { href } => match resolve_import(&href) {
                    Some(index) => {
                        imported.font_faces.extend(index.font_faces.iter().cloned());
                        imported.rules.extend(index.rules.iter().cloned());
                    }
                    None => log::debug!("@import {} not resolved", href),
                },
                CssRule::FontFace { declarations } => {
                    if let Some(face) = font_face(&declarations, &lookup_font) {
                        own.font_faces.push(face);
                    }
                }
                CssRule::Style {
                    selectors,
                    declarations,
                } => own.push_style_rule(&selectors, &declarations),
            }
        }

        imported.font_faces.append(&mut own.font_faces);
        imported.rules.append(&mut own.rules);
        imported
    }

    fn push_style_rule(&mut self, selectors: &str, declarations: &[Declaration]) {
        let Some(decl) = css::find_declaration(declarations, "font-family") else {
            return;
        };
        let chain = css::parse_family_list(&decl.value);
        if chain.is_empty() {
            log::warn!("empty font-family in rule `{}`", selectors.trim());
            return;
        }
        for parsed in selector::parse_selector_list(selectors) {
            if parsed.targets_pseudo_element() {
                log::debug!("skipping pseudo-element rule `{}`", parsed.text);
                continue;
            }
            let mut priority = parsed.priority();
            if decl.important {
                priority += IMPORTANT_BONUS;
            }
            self.rules.push(SelectorRule {
                selector_text: parsed.text.clone(),
                selector: parsed,
                fallback_chain: chain.clone(),
                priority,
                important: decl.important,
            });
        }
    }

    /// Number of indexed items.
    pub fn len(&self) -> usize {
        self.font_faces.len() + self.rules.len()
    }

    /// Whether nothing font-relevant was found.
    pub fn is_empty(&self) -> bool {
        self.font_faces.is_empty() && self.rules.is_empty()
    }
}

fn font_face<L>(declarations: &[Declaration], lookup_font: &L) -> Option<FontFamilyDeclaration>
where
    L: Fn(&str) -> Option<Resource>,
{
    let family = css::find_declaration(declarations, "font-family")?;
    let family_name = css::normalize_family(&family.value);
    if family_name.is_empty() {
        return None;
    }
    let src = css::find_declaration(declarations, "src")?;
    let candidate_resources: Vec<Resource> = font_face_urls(&src.value)
        .into_iter()
        .filter_map(|url| {
            let found = lookup_font(basename(&url));
            if found.is_none() {
                log::debug!("@font-face {}: {} not in bundle", family_name, url);
            }
            found
        })
        .collect();
    if candidate_resources.is_empty() {
        return None;
    }
    Some(FontFamilyDeclaration {
        family_name,
        candidate_resources,
    })
}

/// `url(...)` targets of a `src` descriptor, skipping `data:` URIs.
/// `local(...)` entries are never returned.
pub fn font_face_urls(src: &str) -> Vec<String> {
    let mut out = Vec::new();
    let lower = src.to_ascii_lowercase();
    let mut cursor = 0usize;
    while let Some(found) = lower[cursor..].find("url(") {
        let start = cursor + found + 4;
        let Some(len) = src[start..].find(')') else {
            break;
        };
        let raw = src[start..start + len]
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim();
        cursor = start + len + 1;
        if raw.is_empty() || raw.get(..5).is_some_and(|s| s.eq_ignore_ascii_case("data:")) {
            continue;
        }
        out.push(raw.to_string());
    }
    out
}
