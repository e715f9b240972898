//! Font-family cascade over one document.
//!
//! Every matched rule covers its element and all descendants. An element
//! takes the covering declaration with the highest priority; ties go to the
//! declaration matched on the closest ancestor (or the element itself), then
//! to the later-discovered one. Chains are then resolved parents-first so
//! `inherit` and `unset` can splice the parent's final chain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::css;
use crate::markup::{Document, ElementId};
use crate::selector::{IMPORTANT_BONUS, INLINE_STYLE_WEIGHT};
use crate::stylesheet::{StylesheetIndex, INHERIT, INITIAL, UNSET};

/// Declaration that won the cascade for an element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppliedDeclaration {
    /// Element the declaration was matched on.
    pub owner: ElementId,
    /// Priority including the important bonus.
    pub priority: i32,
    /// Position in discovery order.
    pub discovery: usize,
}

impl AppliedDeclaration {
    fn key(&self, depth: usize) -> (i32, usize, usize) {
        (self.priority, depth, self.discovery)
    }
}

/// Cascade outcome for one element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementStyle {
    /// Winning declaration, if any covers the element.
    pub applied: Option<AppliedDeclaration>,
    /// Index into [`ResolvedDocument::chains`].
    pub chain: usize,
}

/// Resolved chains for every element of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDocument {
    styles: Vec<ElementStyle>,
    chains: Vec<Vec<String>>,
}

impl ResolvedDocument {
    /// Resolved fallback chain of `element`; empty when nothing applies.
    pub fn chain(&self, element: ElementId) -> &[String] {
        self.styles
            .get(element.index())
            .and_then(|style| self.chains.get(style.chain))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Cascade record of `element`.
    pub fn style(&self, element: ElementId) -> Option<&ElementStyle> {
        self.styles.get(element.index())
    }

    /// Distinct resolved chains; index 0 is always the empty chain.
    pub fn chains(&self) -> &[Vec<String>] {
        &self.chains
    }
}

/// Unresolved chain of the declaration an element owns.
struct Candidate<'a> {
    chain: &'a [String],
}

/// Resolve every element of `doc` against `sheets`, given in discovery
/// order. Inline `style` attributes are discovered after all sheets.
pub fn resolve_document(doc: &Document, sheets: &[Arc<StylesheetIndex>]) -> ResolvedDocument {
    let rule_count: usize = sheets.iter().map(|sheet| sheet.rules.len()).sum();
    let inline: Vec<Option<(Vec<String>, bool)>> = doc
        .elements()
        .iter()
        .map(|el| {
            let style = el.attr("style")?;
            let decls = css::parse_declarations(style);
            let decl = css::find_declaration(&decls, "font-family")?;
            let chain = css::parse_family_list(&decl.value);
            (!chain.is_empty()).then_some((chain, decl.important))
        })
        .collect();

    let mut winners: Vec<Option<AppliedDeclaration>> = Vec::with_capacity(doc.len());
    let mut sources: Vec<Option<Candidate<'_>>> = Vec::with_capacity(doc.len());

    for id in doc.ids() {
        let element = doc.element(id);
        let mut own: Option<(AppliedDeclaration, Candidate<'_>)> = None;
        let mut discovery = 0usize;
        for sheet in sheets {
            for rule in &sheet.rules {
                let this = discovery;
                discovery += 1;
                if own
                    .as_ref()
                    .is_some_and(|(best, _)| best.priority > rule.priority)
                {
                    continue;
                }
                if !rule.selector.matches(doc, id) {
                    continue;
                }
                own = Some((
                    AppliedDeclaration {
                        owner: id,
                        priority: rule.priority,
                        discovery: this,
                    },
                    Candidate {
                        chain: &rule.fallback_chain,
                    },
                ));
            }
        }
        if let Some((chain, important)) = &inline[id.index()] {
            let priority = INLINE_STYLE_WEIGHT + if *important { IMPORTANT_BONUS } else { 0 };
            if !own.as_ref().is_some_and(|(best, _)| best.priority > priority) {
                own = Some((
                    AppliedDeclaration {
                        owner: id,
                        priority,
                        discovery: rule_count + id.index(),
                    },
                    Candidate { chain },
                ));
            }
        }

        let inherited = element
            .parent
            .and_then(|parent| winners[parent.index()].map(|w| (w, doc.element(w.owner).depth)));
        let winner = match (own, inherited) {
            (Some((own_decl, candidate)), Some((parent_decl, parent_depth))) => {
                if own_decl.key(element.depth) > parent_decl.key(parent_depth) {
                    sources.push(Some(candidate));
                    Some(own_decl)
                } else {
                    sources.push(None);
                    Some(parent_decl)
                }
            }
            (Some((own_decl, candidate)), None) => {
                sources.push(Some(candidate));
                Some(own_decl)
            }
            (None, inherited) => {
                sources.push(None);
                inherited.map(|(decl, _)| decl)
            }
        };
        winners.push(winner);
    }

    let mut interner: HashMap<Vec<String>, usize> = HashMap::new();
    let mut chains: Vec<Vec<String>> = vec![Vec::new()];
    interner.insert(Vec::new(), 0);
    let mut styles: Vec<ElementStyle> = Vec::with_capacity(doc.len());

    for id in doc.ids() {
        let parent_chain = doc
            .element(id)
            .parent
            .map_or(0, |parent| styles[parent.index()].chain);
        let chain = match &sources[id.index()] {
            // Covered by an ancestor's declaration, or by nothing.
            None => parent_chain,
            Some(candidate) => {
                let resolved = splice(candidate.chain, &chains[parent_chain]);
                match interner.get(&resolved) {
                    Some(&existing) => existing,
                    None => {
                        let next = chains.len();
                        interner.insert(resolved.clone(), next);
                        chains.push(resolved);
                        next
                    }
                }
            }
        };
        styles.push(ElementStyle {
            applied: winners[id.index()],
            chain,
        });
    }

    ResolvedDocument { styles, chains }
}

fn splice(chain: &[String], parent: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(chain.len() + parent.len());
    for token in chain {
        match token.as_str() {
            INHERIT | UNSET => {
                for inherited in parent {
                    if !out.contains(inherited) {
                        out.push(inherited.clone());
                    }
                }
            }
            INITIAL => {}
            name => {
                if !out.iter().any(|existing| existing == name) {
                    out.push(name.to_string());
                }
            }
        }
    }
    out
}
