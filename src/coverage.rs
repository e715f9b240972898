//! Greedy allocation of demanded code points to font resources.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rayon::prelude::*;

use crate::cmap::FontResource;
use crate::glyphs::{ChainSignature, GlyphDemand};
use crate::stylesheet::FontFamilyDeclaration;

/// Code points a font must keep and those nobody in its chain can supply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoverageResult {
    /// Code points this font supplies.
    pub retained: BTreeSet<u32>,
    /// Demanded code points left over when the chain ran out at this font.
    pub missing: BTreeSet<u32>,
}

impl CoverageResult {
    fn merge(&mut self, other: CoverageResult) {
        self.retained.extend(other.retained);
        self.missing.extend(other.missing);
    }
}

/// What to do with one font resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Cmap could not be read; leave the resource alone.
    KeepUnreadable,
    /// No demanded code point is supplied by this font.
    Delete,
    /// Some demanded code points are unavailable; leave unmodified.
    Report {
        /// Code points nobody could supply.
        missing: BTreeSet<u32>,
    },
    /// Reduce to these code points.
    Subset {
        /// Retained code points plus the safety code point.
        codepoints: BTreeSet<u32>,
    },
}

/// Loaded fonts plus the family names that reference them.
#[derive(Clone, Debug, Default)]
pub struct FontCatalog {
    fonts: Vec<FontResource>,
    by_href: HashMap<String, usize>,
    families: BTreeMap<String, Vec<usize>>,
}

impl FontCatalog {
    /// Catalog over `fonts`, with no families declared yet.
    pub fn new(fonts: Vec<FontResource>) -> Self {
        let by_href = fonts
            .iter()
            .enumerate()
            .map(|(idx, font)| (font.resource.href.clone(), idx))
            .collect();
        Self {
            fonts,
            by_href,
            families: BTreeMap::new(),
        }
    }

    /// Register an `@font-face` declaration. Several declarations of one
    /// family accumulate candidates in discovery order.
    pub fn declare(&mut self, declaration: &FontFamilyDeclaration) {
        let candidates = self
            .families
            .entry(declaration.family_name.clone())
            .or_default();
        for resource in &declaration.candidate_resources {
            match self.by_href.get(&resource.href) {
                Some(&idx) if !candidates.contains(&idx) => candidates.push(idx),
                Some(_) => {}
                None => log::debug!(
                    "family {} references {} which is not a font resource",
                    declaration.family_name,
                    resource.href
                ),
            }
        }
    }

    /// Loaded fonts, in bundle order.
    pub fn fonts(&self) -> &[FontResource] {
        &self.fonts
    }

    /// Candidate font indices for `family`, or `None` for undeclared
    /// (system) families.
    pub fn candidates(&self, family: &str) -> Option<&[usize]> {
        self.families
            .get(family)
            .map(Vec::as_slice)
            .filter(|list| !list.is_empty())
    }
}

/// Outcome of walking one chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainAllocation {
    /// Per-font contribution, keyed by catalog index.
    pub per_font: BTreeMap<usize, CoverageResult>,
    /// Set when no family in the chain is backed by a font resource; holds
    /// the number of demanded code points.
    pub unbacked: Option<usize>,
}

/// Walk `chain` in order and hand each demanded code point to the first
/// font that maps it. Leftovers go to the last font tried.
pub fn allocate_chain(
    catalog: &FontCatalog,
    chain: &[String],
    demand: &BTreeSet<u32>,
) -> ChainAllocation {
    let mut out = ChainAllocation::default();
    let mut remaining = demand.clone();
    let mut last_tried = None;

    'families: for family in chain {
        let Some(candidates) = catalog.candidates(family) else {
            continue;
        };
        for &idx in candidates {
            last_tried = Some(idx);
            let font = &catalog.fonts[idx];
            let supplied: BTreeSet<u32> = remaining.intersection(&font.cmap).copied().collect();
            remaining.retain(|cp| !supplied.contains(cp));
            out.per_font.entry(idx).or_default().retained.extend(supplied);
            if remaining.is_empty() {
                break 'families;
            }
        }
    }

    match last_tried {
        Some(idx) => {
            if !remaining.is_empty() {
                out.per_font.entry(idx).or_default().missing.extend(remaining);
            }
        }
        None => out.unbacked = Some(demand.len()),
    }
    out
}

/// Allocation across every chain, merged per font.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Coverage per catalog index; fonts no chain reached are absent.
    pub per_font: BTreeMap<usize, CoverageResult>,
    /// Chains without any backing font, with their demand size.
    pub unbacked: Vec<(ChainSignature, usize)>,
}

impl Allocation {
    /// Coverage of one font; empty when no chain reached it.
    pub fn coverage(&self, idx: usize) -> CoverageResult {
        self.per_font.get(&idx).cloned().unwrap_or_default()
    }
}

/// Allocate every chain of `demand` independently, then merge.
pub fn allocate(catalog: &FontCatalog, demand: &GlyphDemand) -> Allocation {
    let chains: Vec<(&ChainSignature, &BTreeSet<u32>)> = demand.iter().collect();
    let per_chain: Vec<(&ChainSignature, ChainAllocation)> = chains
        .par_iter()
        .map(|(chain, points)| (*chain, allocate_chain(catalog, chain, points)))
        .collect();

    let mut out = Allocation::default();
    for (chain, allocation) in per_chain {
        for (idx, coverage) in allocation.per_font {
            out.per_font.entry(idx).or_default().merge(coverage);
        }
        if let Some(count) = allocation.unbacked {
            out.unbacked.push((chain.clone(), count));
        }
    }
    out
}

/// Decide the fate of `font` given its merged coverage.
pub fn decide(font: &FontResource, coverage: &CoverageResult, safety_codepoint: u32) -> Decision {
    if !font.is_readable() {
        return Decision::KeepUnreadable;
    }
    if coverage.retained.is_empty() {
        return Decision::Delete;
    }
    if !coverage.missing.is_empty() {
        return Decision::Report {
            missing: coverage.missing.clone(),
        };
    }
    let mut codepoints = coverage.retained.clone();
    if let Some(extra) = safety_pick(&font.cmap, &coverage.retained, safety_codepoint) {
        codepoints.insert(extra);
    }
    Decision::Subset { codepoints }
}

/// Extra code point kept in every subset beyond `retained`: `preferred`
/// when the font maps it and it is not retained yet, else the lowest mapped
/// code point not already retained.
pub fn safety_pick(cmap: &BTreeSet<u32>, retained: &BTreeSet<u32>, preferred: u32) -> Option<u32> {
    if cmap.contains(&preferred) && !retained.contains(&preferred) {
        return Some(preferred);
    }
    cmap.iter().find(|cp| !retained.contains(cp)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Resource, ResourceId, ResourceKind};
    use crate::cmap::{FontContainer, FontFormat};

    fn font(href: &str, cmap: &str) -> FontResource {
        FontResource {
            resource: Resource {
                id: ResourceId(0),
                href: href.to_string(),
                kind: ResourceKind::Font,
            },
            format: Some(FontFormat::Sfnt),
            container: FontContainer::Single,
            cmap: cmap.chars().map(u32::from).collect(),
            unreadable: None,
        }
    }

    fn declare(catalog: &mut FontCatalog, family: &str, hrefs: &[&str]) {
        let candidate_resources = hrefs
            .iter()
            .map(|href| Resource {
                id: ResourceId(0),
                href: href.to_string(),
                kind: ResourceKind::Font,
            })
            .collect();
        catalog.declare(&FontFamilyDeclaration {
            family_name: family.to_string(),
            candidate_resources,
        });
    }

    fn points(text: &str) -> BTreeSet<u32> {
        text.chars().map(u32::from).collect()
    }

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn shared_font_reports_missing_across_chains() {
        let mut catalog = FontCatalog::new(vec![font("f.ttf", "ABC")]);
        declare(&mut catalog, "f", &["f.ttf"]);
        let mut demand = GlyphDemand::new();
        demand.add_text(&chain(&["f"]), "AD");
        demand.add_text(&chain(&["f", "serif"]), "B");

        let allocation = allocate(&catalog, &demand);
        let coverage = allocation.coverage(0);
        assert_eq!(coverage.retained, points("AB"));
        assert_eq!(coverage.missing, points("D"));
        assert_eq!(
            decide(&catalog.fonts()[0], &coverage, 0x7684),
            Decision::Report {
                missing: points("D")
            }
        );
    }

    #[test]
    fn chain_walk_conserves_demand() {
        let mut catalog = FontCatalog::new(vec![
            font("a.ttf", "AB"),
            font("b.ttf", "BCD"),
            font("c.ttf", "X"),
        ]);
        declare(&mut catalog, "one", &["a.ttf"]);
        declare(&mut catalog, "two", &["b.ttf", "c.ttf"]);
        let demand = points("ABCDEZ");
        let result = allocate_chain(&catalog, &chain(&["system", "one", "two"]), &demand);

        let mut union = BTreeSet::new();
        let mut total = 0;
        for coverage in result.per_font.values() {
            total += coverage.retained.len() + coverage.missing.len();
            union.extend(coverage.retained.iter().copied());
            union.extend(coverage.missing.iter().copied());
        }
        assert_eq!(union, demand);
        assert_eq!(total, demand.len());
        assert_eq!(result.per_font[&0].retained, points("AB"));
        assert_eq!(result.per_font[&1].retained, points("CD"));
        assert_eq!(result.per_font[&2].missing, points("EZ"));
    }

    #[test]
    fn walk_stops_once_demand_is_met() {
        let mut catalog = FontCatalog::new(vec![font("a.ttf", "AB"), font("b.ttf", "AB")]);
        declare(&mut catalog, "one", &["a.ttf"]);
        declare(&mut catalog, "two", &["b.ttf"]);
        let result = allocate_chain(&catalog, &chain(&["one", "two"]), &points("A"));
        assert!(!result.per_font.contains_key(&1));
        assert_eq!(
            decide(&catalog.fonts()[1], &CoverageResult::default(), 0x7684),
            Decision::Delete
        );
    }

    #[test]
    fn unbacked_chain_is_reported_once() {
        let catalog = FontCatalog::new(vec![font("a.ttf", "A")]);
        let mut demand = GlyphDemand::new();
        demand.add_text(&chain(&["serif"]), "xyz");
        let allocation = allocate(&catalog, &demand);
        assert_eq!(allocation.unbacked, vec![(chain(&["serif"]), 3)]);
        assert!(allocation.per_font.is_empty());
    }

    #[test]
    fn subset_adds_safety_codepoint() {
        let f = font("a.ttf", "AB的");
        let coverage = CoverageResult {
            retained: points("A"),
            missing: BTreeSet::new(),
        };
        assert_eq!(
            decide(&f, &coverage, 0x7684),
            Decision::Subset {
                codepoints: points("A的")
            }
        );
        let g = font("g.ttf", "AB");
        assert_eq!(
            decide(&g, &coverage, 0x7684),
            Decision::Subset {
                codepoints: points("AB")
            }
        );
    }

    #[test]
    fn safety_falls_through_when_preferred_is_already_retained() {
        let cmap = points("AB的");
        assert_eq!(safety_pick(&cmap, &points("A的"), 0x7684), Some(u32::from('B')));
        assert_eq!(safety_pick(&cmap, &points("AB的"), 0x7684), None);

        let f = font("a.ttf", "AB的");
        let coverage = CoverageResult {
            retained: points("的"),
            missing: BTreeSet::new(),
        };
        assert_eq!(
            decide(&f, &coverage, 0x7684),
            Decision::Subset {
                codepoints: points("A的")
            }
        );
    }

    #[test]
    fn unreadable_fonts_are_kept() {
        let mut f = font("a.ttf", "");
        f.unreadable = Some("bad".into());
        assert_eq!(
            decide(&f, &CoverageResult::default(), 0x7684),
            Decision::KeepUnreadable
        );
    }
}
