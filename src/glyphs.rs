//! Code point demand keyed by fallback-chain signature.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use crate::cascade::ResolvedDocument;
use crate::markup::Document;

/// Ordered family names, CSS-wide keywords excluded.
pub type ChainSignature = Vec<String>;

/// Required code points per fallback chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlyphDemand {
    by_chain: BTreeMap<ChainSignature, BTreeSet<u32>>,
}

impl GlyphDemand {
    /// Empty demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Demand of one resolved document.
    pub fn from_document(doc: &Document, resolved: &ResolvedDocument) -> Self {
        let mut demand = Self::new();
        for id in doc.ids() {
            let chain = resolved.chain(id);
            if chain.is_empty() {
                continue;
            }
            demand.add_text(chain, &doc.element(id).text);
        }
        demand
    }

    /// Add every non-whitespace character of `text` under `chain`.
    pub fn add_text(&mut self, chain: &[String], text: &str) {
        let mut points = text
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .map(u32::from)
            .peekable();
        if points.peek().is_none() || chain.is_empty() {
            return;
        }
        if let Some(set) = self.by_chain.get_mut(chain) {
            set.extend(points);
            return;
        }
        self.by_chain.insert(chain.to_vec(), points.collect());
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: GlyphDemand) {
        for (chain, points) in other.by_chain {
            match self.by_chain.entry(chain) {
                Entry::Occupied(mut slot) => slot.get_mut().extend(points),
                Entry::Vacant(slot) => {
                    slot.insert(points);
                }
            }
        }
    }

    /// Chains with their demand, ordered by signature.
    pub fn iter(&self) -> impl Iterator<Item = (&ChainSignature, &BTreeSet<u32>)> {
        self.by_chain.iter()
    }

    /// Demand for one chain.
    pub fn get(&self, chain: &[String]) -> Option<&BTreeSet<u32>> {
        self.by_chain.get(chain)
    }

    /// Number of distinct chains.
    pub fn len(&self) -> usize {
        self.by_chain.len()
    }

    /// Whether no code point is demanded.
    pub fn is_empty(&self) -> bool {
        self.by_chain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn whitespace_including_ideographic_space_is_dropped() {
        let mut demand = GlyphDemand::new();
        demand.add_text(&chain(&["a"]), " x\u{3000}y\n\t x ");
        demand.add_text(&chain(&["b"]), " \u{3000} ");
        demand.add_text(&[], "ignored");
        assert_eq!(demand.len(), 1);
        let points: Vec<u32> = demand.get(&chain(&["a"])).into_iter().flatten().copied().collect();
        assert_eq!(points, vec!['x' as u32, 'y' as u32]);
    }

    #[test]
    fn merge_unions_per_chain() {
        let mut left = GlyphDemand::new();
        left.add_text(&chain(&["a", "b"]), "AB");
        let mut right = GlyphDemand::new();
        right.add_text(&chain(&["a", "b"]), "BC");
        right.add_text(&chain(&["c"]), "Z");
        left.merge(right);
        assert_eq!(left.len(), 2);
        assert_eq!(left.get(&chain(&["a", "b"])).map(BTreeSet::len), Some(3));
    }
}
