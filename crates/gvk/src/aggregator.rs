//! Source -> GVK registry with a reverse index (GVK -> referencing sources).
//!
//! Each source owns exactly one GVK set, replaced wholesale on upsert. A GVK is present
//! iff its reverse-index entry is non-empty; empty entries are removed, never kept.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tollgate_core::{Gvk, SourceKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    #[error("reverse index for {gvk} is missing source {source_key}")]
    MissingReverseEntry { gvk: Gvk, source_key: SourceKey },
}

#[derive(Debug, Clone, Default)]
pub struct GvkAggregator {
    source_to_gvks: FxHashMap<SourceKey, FxHashSet<Gvk>>,
    gvk_to_sources: FxHashMap<Gvk, FxHashSet<SourceKey>>,
}

impl GvkAggregator {
    pub fn new() -> Self { Self::default() }

    /// Replace the full GVK set owned by `source`. An empty set removes the source.
    pub fn upsert(&mut self, source: SourceKey, gvks: impl IntoIterator<Item = Gvk>) -> Result<(), AggregatorError> {
        let next: FxHashSet<Gvk> = gvks.into_iter().collect();
        let dropped: SmallVec<[Gvk; 8]> = match self.source_to_gvks.get(&source) {
            Some(prev) => prev.difference(&next).cloned().collect(),
            None => SmallVec::new(),
        };
        // validate before touching anything so a failure leaves both maps as they were
        self.check_linked(&source, &dropped)?;

        for gvk in &dropped {
            self.unlink(gvk, &source);
        }
        for gvk in &next {
            self.gvk_to_sources.entry(gvk.clone()).or_default().insert(source.clone());
        }
        if next.is_empty() {
            self.source_to_gvks.remove(&source);
        } else {
            self.source_to_gvks.insert(source, next);
        }
        Ok(())
    }

    /// Remove a source and all its reverse references. Unknown sources are a no-op.
    pub fn remove(&mut self, source: &SourceKey) -> Result<(), AggregatorError> {
        let owned: SmallVec<[Gvk; 8]> = match self.source_to_gvks.get(source) {
            Some(gvks) => gvks.iter().cloned().collect(),
            None => return Ok(()),
        };
        self.check_linked(source, &owned)?;
        for gvk in &owned {
            self.unlink(gvk, source);
        }
        self.source_to_gvks.remove(source);
        Ok(())
    }

    pub fn is_present(&self, gvk: &Gvk) -> bool { self.gvk_to_sources.contains_key(gvk) }

    /// GVKs currently owned by `source` (empty if unknown).
    pub fn list(&self, source: &SourceKey) -> FxHashSet<Gvk> {
        self.source_to_gvks.get(source).cloned().unwrap_or_default()
    }

    /// Union of all GVKs referenced by any source, in no particular order.
    pub fn list_all_gvks(&self) -> Vec<Gvk> { self.gvk_to_sources.keys().cloned().collect() }

    pub fn sources_for(&self, gvk: &Gvk) -> FxHashSet<SourceKey> {
        self.gvk_to_sources.get(gvk).cloned().unwrap_or_default()
    }

    pub fn source_count(&self) -> usize { self.source_to_gvks.len() }

    pub fn is_empty(&self) -> bool { self.source_to_gvks.is_empty() }

    fn check_linked(&self, source: &SourceKey, gvks: &[Gvk]) -> Result<(), AggregatorError> {
        for gvk in gvks {
            let linked = self.gvk_to_sources.get(gvk).map(|s| s.contains(source)).unwrap_or(false);
            if !linked {
                return Err(AggregatorError::MissingReverseEntry { gvk: gvk.clone(), source_key: source.clone() });
            }
        }
        Ok(())
    }

    fn unlink(&mut self, gvk: &Gvk, source: &SourceKey) {
        if let Some(sources) = self.gvk_to_sources.get_mut(gvk) {
            sources.remove(source);
            if sources.is_empty() {
                self.gvk_to_sources.remove(gvk);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt_reverse_index(&mut self, gvk: &Gvk) { self.gvk_to_sources.remove(gvk); }
}
