//! Shard assignment.
//!
//! Two interchangeable policies:
//! - `FixedCount`: shard `index / capacity`. Deterministic from the sample index alone, which
//!   is what makes resuming and splitting a stream across workers line up exactly.
//! - `Keyed`: shard chosen by the sample's group key through a [`KeyAssignment`].

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

use crate::sample::Sample;
use crate::{Error, Result};

/// Numeric shard identifier. Archive names are its zero-padded, ten-digit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub u64);

impl ShardId {
    /// `{id:010}`, so lexical and numeric ordering coincide.
    pub fn file_stem(&self) -> String {
        format!("{:010}", self.0)
    }

    pub fn archive_name(&self) -> String {
        format!("{}.tar", self.file_stem())
    }

    pub fn table_name(&self) -> String {
        format!("{}.parquet", self.file_stem())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

/// Member name for a sample-local file: `{index:016}.{ext}`.
pub fn member_name(index: u64, ext: &str) -> String {
    format!("{index:016}.{ext}")
}

/// Maps categorical group keys to shard ids.
///
/// Keys can be declared up front (e.g. from a pre-scanned class list) and the assignment
/// frozen, in which case an undeclared key is a schema error. Otherwise unknown keys take the
/// next free id in first-sight order.
#[derive(Debug, Clone, Default)]
pub struct KeyAssignment {
    ids: BTreeMap<String, ShardId>,
    next_id: u64,
    frozen: bool,
}

impl KeyAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frozen assignment from declared `(key, id)` pairs.
    pub fn declared<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        let mut assignment = Self::new();
        for (key, id) in pairs {
            assignment.declare(key, ShardId(id))?;
        }
        assignment.frozen = true;
        Ok(assignment)
    }

    /// Bind `key` to `id`. Rebinding a key or reusing an id is a configuration error.
    pub fn declare(&mut self, key: impl Into<String>, id: ShardId) -> Result<()> {
        let key = key.into();
        if let Some(existing) = self.ids.get(&key) {
            return Err(Error::config(format!(
                "group key '{key}' already bound to shard {existing}"
            )));
        }
        if self.ids.values().any(|v| *v == id) {
            return Err(Error::config(format!("shard {id} bound to more than one key")));
        }
        self.next_id = self.next_id.max(id.0 + 1);
        self.ids.insert(key, id);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<ShardId> {
        self.ids.get(key).copied()
    }

    /// Look up `key`, assigning it the next free id if allowed.
    pub fn resolve(&mut self, key: &str) -> Result<ShardId> {
        if let Some(id) = self.get(key) {
            return Ok(id);
        }
        if self.frozen {
            return Err(Error::Schema {
                group: key.to_owned(),
                message: "group key was not declared".to_owned(),
            });
        }
        let id = ShardId(self.next_id);
        self.declare(key, id)?;
        Ok(id)
    }

    /// Find the key bound to `id`.
    pub fn key_of(&self, id: ShardId) -> Option<&str> {
        self.ids
            .iter()
            .find_map(|(k, v)| (*v == id).then_some(k.as_str()))
    }
}

/// The rule mapping a sample to a shard.
#[derive(Debug, Clone)]
pub enum PartitionPolicy {
    FixedCount { capacity: NonZeroU64 },
    Keyed(KeyAssignment),
}

impl PartitionPolicy {
    /// Sequential partitioning with `capacity` samples per shard.
    pub fn fixed_count(capacity: u64) -> Result<Self> {
        let capacity = NonZeroU64::new(capacity)
            .ok_or_else(|| Error::config("shard capacity must be greater than zero"))?;
        Ok(Self::FixedCount { capacity })
    }

    pub fn keyed(assignment: KeyAssignment) -> Self {
        Self::Keyed(assignment)
    }

    /// Pick the shard for `sample`.
    pub fn shard_for(&mut self, sample: &Sample) -> Result<ShardId> {
        match self {
            Self::FixedCount { capacity } => Ok(ShardId(sample.index / capacity.get())),
            Self::Keyed(assignment) => {
                let key = sample.group_key.as_deref().ok_or_else(|| Error::Schema {
                    group: String::new(),
                    message: format!("sample {} has no group key", sample.index),
                })?;
                assignment.resolve(key)
            }
        }
    }

    /// Samples per shard, for sequential partitioning.
    pub fn capacity(&self) -> Option<NonZeroU64> {
        match self {
            Self::FixedCount { capacity } => Some(*capacity),
            Self::Keyed(_) => None,
        }
    }

    /// Global index of the first sample in `shard` (sequential partitioning only).
    pub fn first_index(&self, shard: ShardId) -> Result<u64> {
        let capacity = self
            .capacity()
            .ok_or_else(|| Error::config("keyed partitioning has no positional shard start"))?;
        shard.0.checked_mul(capacity.get()).ok_or_else(|| {
            Error::config(format!(
                "shard {shard} with capacity {capacity} overflows the sample index"
            ))
        })
    }

    /// Number of shards `total` samples produce (sequential partitioning only).
    pub fn shard_count(&self, total: u64) -> Option<u64> {
        self.capacity().map(|c| total.div_ceil(c.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(index: u64) -> Sample {
        Sample::new(index, json!({}))
    }

    #[test]
    fn fixed_count_shard_is_index_div_capacity() -> anyhow::Result<()> {
        let mut policy = PartitionPolicy::fixed_count(4)?;
        let ids: Vec<u64> = (0..10)
            .map(|i| policy.shard_for(&sample(i)).map(|s| s.0))
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2]);
        Ok(())
    }

    #[test]
    fn shard_count_is_ceiling_for_any_capacity() -> anyhow::Result<()> {
        for capacity in 1..=7u64 {
            let policy = PartitionPolicy::fixed_count(capacity)?;
            for total in 0..=30u64 {
                let mut sizes = std::collections::BTreeMap::<u64, u64>::new();
                for i in 0..total {
                    *sizes.entry(i / capacity).or_default() += 1;
                }
                assert_eq!(policy.shard_count(total), Some(sizes.len() as u64));
                let last = sizes.keys().next_back().copied();
                for (id, size) in &sizes {
                    if Some(*id) != last {
                        assert_eq!(*size, capacity);
                    } else {
                        let rem = total % capacity;
                        assert_eq!(*size, if rem == 0 { capacity } else { rem });
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            PartitionPolicy::fixed_count(0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn first_index_overflow_is_a_config_error() -> anyhow::Result<()> {
        let policy = PartitionPolicy::fixed_count(u64::MAX)?;
        assert_eq!(policy.first_index(ShardId(1))?, u64::MAX);
        assert!(policy.first_index(ShardId(2)).is_err());
        Ok(())
    }

    #[test]
    fn keyed_assigns_first_sight_ids() -> anyhow::Result<()> {
        let mut policy = PartitionPolicy::keyed(KeyAssignment::new());
        let a = policy.shard_for(&sample(0).with_group_key("bowling"))?;
        let b = policy.shard_for(&sample(1).with_group_key("surfing"))?;
        let a2 = policy.shard_for(&sample(2).with_group_key("bowling"))?;
        assert_eq!((a, b, a2), (ShardId(0), ShardId(1), ShardId(0)));
        Ok(())
    }

    #[test]
    fn frozen_assignment_rejects_unknown_and_missing_keys() -> anyhow::Result<()> {
        let mut policy = PartitionPolicy::keyed(KeyAssignment::declared([("bowling", 7)])?);
        assert_eq!(policy.shard_for(&sample(0).with_group_key("bowling"))?, ShardId(7));
        assert!(matches!(
            policy.shard_for(&sample(1).with_group_key("surfing")),
            Err(Error::Schema { .. })
        ));
        assert!(matches!(
            policy.shard_for(&sample(2)),
            Err(Error::Schema { .. })
        ));
        Ok(())
    }

    #[test]
    fn names_are_zero_padded() {
        assert_eq!(ShardId(42).archive_name(), "0000000042.tar");
        assert_eq!(ShardId(42).table_name(), "0000000042.parquet");
        assert_eq!(member_name(7, "mp4"), "0000000000000007.mp4");
    }
}
