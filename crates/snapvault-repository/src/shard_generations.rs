//! Per-shard generation tokens tracked in the root metadata.

use std::collections::BTreeMap;

use snapvault_types::{IndexId, ShardGeneration};

/// Mapping from `(index, shard)` to the shard's current generation.
///
/// A `None` slot means the generation is not tracked; readers resolve it by
/// listing the shard folder for the highest numeric `index-N` blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardGenerations {
    shards: BTreeMap<IndexId, Vec<Option<ShardGeneration>>>,
}

impl ShardGenerations {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexId> {
        self.shards.keys()
    }

    /// Generations of every shard of `index`, indexed by shard number.
    pub fn generations(&self, index: &IndexId) -> &[Option<ShardGeneration>] {
        self.shards.get(index).map_or(&[], Vec::as_slice)
    }

    pub fn get(&self, index: &IndexId, shard: u32) -> Option<&ShardGeneration> {
        self.shards
            .get(index)
            .and_then(|gens| gens.get(shard as usize))
            .and_then(Option::as_ref)
    }

    pub fn total_shards(&self) -> usize {
        self.shards.values().map(Vec::len).sum()
    }

    /// Every tracked `(index, shard, generation)` triple.
    pub fn iter(&self) -> impl Iterator<Item = (&IndexId, u32, &ShardGeneration)> {
        self.shards.iter().flat_map(|(index, gens)| {
            gens.iter()
                .enumerate()
                .filter_map(move |(shard, generation)| {
                    generation.as_ref().map(|g| (index, shard as u32, g))
                })
        })
    }

    /// Sets one shard's generation, growing the index's slot list as needed.
    pub fn with(mut self, index: IndexId, shard: u32, generation: Option<ShardGeneration>) -> Self {
        let gens = self.shards.entry(index).or_default();
        let slot = shard as usize;
        if gens.len() <= slot {
            gens.resize(slot + 1, None);
        }
        gens[slot] = generation;
        self
    }

    /// Declares that `index` has `shards` shards without known generations.
    pub fn with_index(mut self, index: IndexId, shards: u32) -> Self {
        let gens = self.shards.entry(index).or_default();
        if gens.len() < shards as usize {
            gens.resize(shards as usize, None);
        }
        self
    }

    /// Overlays `updates` on top of `self`: known generations in `updates`
    /// replace the existing ones; unknown slots keep the existing value.
    pub fn merged_with(&self, updates: &ShardGenerations) -> Self {
        let mut merged = self.clone();
        for (index, gens) in &updates.shards {
            let target = merged.shards.entry(index.clone()).or_default();
            if target.len() < gens.len() {
                target.resize(gens.len(), None);
            }
            for (slot, generation) in gens.iter().enumerate() {
                if generation.is_some() {
                    target[slot].clone_from(generation);
                }
            }
        }
        merged
    }

    /// Keeps only indices for which `keep` returns true.
    pub fn retain(mut self, mut keep: impl FnMut(&IndexId) -> bool) -> Self {
        self.shards.retain(|index, _| keep(index));
        self
    }

    /// Drops every opaque generation, keeping numeric ones.
    pub fn without_uuids(&self) -> Self {
        let shards = self
            .shards
            .iter()
            .map(|(index, gens)| {
                let gens = gens
                    .iter()
                    .map(|g| g.clone().filter(ShardGeneration::is_legacy))
                    .collect();
                (index.clone(), gens)
            })
            .collect();
        Self { shards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> IndexId {
        IndexId::new("logs", "i1")
    }

    #[test]
    fn merge_prefers_known_updates() {
        let base = ShardGenerations::empty()
            .with(index(), 0, Some(ShardGeneration::Uuid("a".into())))
            .with(index(), 1, Some(ShardGeneration::Uuid("b".into())));
        let updates = ShardGenerations::empty()
            .with(index(), 1, Some(ShardGeneration::Uuid("c".into())))
            .with(index(), 2, None);

        let merged = base.merged_with(&updates);
        assert_eq!(merged.get(&index(), 0), Some(&ShardGeneration::Uuid("a".into())));
        assert_eq!(merged.get(&index(), 1), Some(&ShardGeneration::Uuid("c".into())));
        assert_eq!(merged.get(&index(), 2), None);
        assert_eq!(merged.generations(&index()).len(), 3);
    }

    #[test]
    fn without_uuids_keeps_legacy_slots() {
        let gens = ShardGenerations::empty()
            .with(index(), 0, Some(ShardGeneration::Legacy(4)))
            .with(index(), 1, Some(ShardGeneration::random()));

        let stripped = gens.without_uuids();
        assert_eq!(stripped.get(&index(), 0), Some(&ShardGeneration::Legacy(4)));
        assert_eq!(stripped.get(&index(), 1), None);
        assert_eq!(stripped.total_shards(), 2);
    }

    #[test]
    fn iter_skips_unknown_slots() {
        let gens = ShardGenerations::empty()
            .with_index(index(), 3)
            .with(index(), 1, Some(ShardGeneration::Legacy(0)));
        let tracked: Vec<_> = gens.iter().map(|(_, shard, _)| shard).collect();
        assert_eq!(tracked, vec![1]);
    }
}
