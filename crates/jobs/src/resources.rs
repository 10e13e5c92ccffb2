//! Named resource pools (e.g. `gpu`, `memory_mb`) that jobs reserve from.

use std::collections::{BTreeMap, HashMap};

use jobflow_core::JobId;

use crate::error::JobError;
use crate::types::PoolStats;

#[derive(Debug, Default)]
pub(crate) struct ResourcePools {
    totals: BTreeMap<String, u64>,
    held: HashMap<JobId, HashMap<String, u64>>,
}

impl ResourcePools {
    pub(crate) fn set_limit(&mut self, name: impl Into<String>, total: u64) {
        self.totals.insert(name.into(), total);
    }

    fn allocated(&self, name: &str) -> u64 {
        self.held
            .values()
            .filter_map(|amounts| amounts.get(name))
            .sum()
    }

    fn available(&self, name: &str) -> Option<u64> {
        self.totals
            .get(name)
            .map(|total| total.saturating_sub(self.allocated(name)))
    }

    /// Reserve every requested amount, or nothing.
    pub(crate) fn allocate(
        &mut self,
        id: &JobId,
        request: &HashMap<String, u64>,
    ) -> Result<(), JobError> {
        for (name, &requested) in request {
            let available = self
                .available(name)
                .ok_or_else(|| JobError::UnknownResource(name.clone()))?;
            if requested > available {
                return Err(JobError::ResourceExhausted {
                    resource: name.clone(),
                    requested,
                    available,
                });
            }
        }

        let held = self.held.entry(id.clone()).or_default();
        for (name, &amount) in request {
            *held.entry(name.clone()).or_insert(0) += amount;
        }
        Ok(())
    }

    /// Release the named resources, or all of them when `names` is `None`.
    /// Returns the amounts released.
    pub(crate) fn release(&mut self, id: &JobId, names: Option<&[String]>) -> HashMap<String, u64> {
        let Some(held) = self.held.get_mut(id) else {
            return HashMap::new();
        };
        let released = match names {
            None => std::mem::take(held),
            Some(names) => names
                .iter()
                .filter_map(|name| held.remove_entry(name))
                .collect(),
        };
        if held.is_empty() {
            self.held.remove(id);
        }
        released
    }

    pub(crate) fn held_by(&self, id: &JobId) -> HashMap<String, u64> {
        self.held.get(id).cloned().unwrap_or_default()
    }

    pub(crate) fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.totals
            .iter()
            .map(|(name, &total)| {
                let allocated = self.allocated(name);
                (
                    name.clone(),
                    PoolStats {
                        total,
                        allocated,
                        available: total.saturating_sub(allocated),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    fn request(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn allocation_is_all_or_nothing() {
        let mut pools = ResourcePools::default();
        pools.set_limit("gpu", 1);
        pools.set_limit("memory_mb", 1024);

        pools
            .allocate(&id("a"), &request(&[("gpu", 1), ("memory_mb", 512)]))
            .unwrap();
        let err = pools
            .allocate(&id("b"), &request(&[("memory_mb", 256), ("gpu", 1)]))
            .unwrap_err();
        assert!(matches!(err, JobError::ResourceExhausted { .. }));
        assert!(pools.held_by(&id("b")).is_empty());
        assert_eq!(pools.stats()["memory_mb"].available, 512);
    }

    #[test]
    fn unknown_pool_is_rejected() {
        let mut pools = ResourcePools::default();
        let err = pools.allocate(&id("a"), &request(&[("tpu", 1)])).unwrap_err();
        assert_eq!(err, JobError::UnknownResource("tpu".into()));
    }

    #[test]
    fn release_named_or_all() {
        let mut pools = ResourcePools::default();
        pools.set_limit("gpu", 2);
        pools.set_limit("cpu", 4);
        pools
            .allocate(&id("a"), &request(&[("gpu", 1), ("cpu", 2)]))
            .unwrap();

        let released = pools.release(&id("a"), Some(&["gpu".to_string()]));
        assert_eq!(released.get("gpu"), Some(&1));
        assert_eq!(pools.stats()["gpu"].allocated, 0);
        assert_eq!(pools.stats()["cpu"].allocated, 2);

        pools.release(&id("a"), None);
        assert_eq!(pools.stats()["cpu"].allocated, 0);
        assert!(pools.held_by(&id("a")).is_empty());
    }
}
