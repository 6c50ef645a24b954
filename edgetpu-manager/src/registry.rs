// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Packages registered by custom-op instances. Entries are keyed by the
//! address of the initializer buffer so that every op instance created from
//! the same model shares one parsed package.

use alloc::collections::BTreeMap;
use edgetpu_executable::EdgeTpuPackage;
use edgetpu_interface::EdgeTpuError;
use edgetpu_shared::PackageId;
use log::{info, trace};
use slab::Slab;

struct Entry {
    key: usize,
    refs: usize,
    generation: u32,
    package: EdgeTpuPackage,
}

pub struct PackageRegistry {
    entries: Slab<Entry>,
    by_key: BTreeMap<usize, usize>,
    next_generation: u32,
}
impl PackageRegistry {
    pub fn new() -> Self {
        PackageRegistry {
            entries: Slab::new(),
            by_key: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Returns the id of the package registered under |key|, taking another
    /// reference, or stores the package built by |parse|.
    pub fn register(
        &mut self,
        key: usize,
        parse: impl FnOnce() -> Result<EdgeTpuPackage, EdgeTpuError>,
    ) -> Result<PackageId, EdgeTpuError> {
        if let Some(&index) = self.by_key.get(&key) {
            let entry = &mut self.entries[index];
            entry.refs += 1;
            return Ok(PackageId {
                index,
                generation: entry.generation,
            });
        }
        let package = parse()?;
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.entries.insert(Entry {
            key,
            refs: 1,
            generation,
            package,
        });
        self.by_key.insert(key, index);
        trace!("Registered package {:#x} as slot {}", key, index);
        Ok(PackageId { index, generation })
    }

    fn entry(&self, id: PackageId) -> Result<&Entry, EdgeTpuError> {
        match self.entries.get(id.index) {
            Some(entry) if entry.generation == id.generation => Ok(entry),
            _ => Err(EdgeTpuError::NoSuchPackage),
        }
    }

    pub fn get(&self, id: PackageId) -> Result<&EdgeTpuPackage, EdgeTpuError> {
        self.entry(id).map(|e| &e.package)
    }

    pub fn get_mut(&mut self, id: PackageId) -> Result<&mut EdgeTpuPackage, EdgeTpuError> {
        match self.entries.get_mut(id.index) {
            Some(entry) if entry.generation == id.generation => Ok(&mut entry.package),
            _ => Err(EdgeTpuError::NoSuchPackage),
        }
    }

    /// Drops one reference to |id|. Returns true when that was the last one
    /// and the package is gone.
    pub fn release(&mut self, id: PackageId) -> Result<bool, EdgeTpuError> {
        let refs = self.entry(id)?.refs;
        if refs > 1 {
            self.entries[id.index].refs -= 1;
            return Ok(false);
        }
        let entry = self.entries.remove(id.index);
        self.by_key.remove(&entry.key);
        trace!("Released package {}", id);
        Ok(true)
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn debug_state(&self) {
        info!(target: "", "Packages:");
        for (index, entry) in self.entries.iter() {
            info!(target: "",
                "  pkg{}.{} buffer {:#x} refs {} caching {:?}",
                index,
                entry.generation,
                entry.key,
                entry.refs,
                entry.package.parameter_caching_token()
            );
        }
    }
}
impl Default for PackageRegistry {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetpu_executable::builder::{ExecutableSpec, PackageBuilder};

    fn parse() -> Result<EdgeTpuPackage, EdgeTpuError> {
        let buffer = PackageBuilder::new().add(&ExecutableSpec::inference()).build();
        EdgeTpuPackage::from_buffer(&buffer)
    }

    #[test]
    fn same_key_shares_entry() {
        let mut registry = PackageRegistry::new();
        let a = registry.register(0x1000, parse).unwrap();
        let b = registry.register(0x1000, || panic!("parsed twice")).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.release(a), Ok(false));
        assert!(registry.get(a).is_ok());
        assert_eq!(registry.release(a), Ok(true));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_ids_are_rejected() {
        let mut registry = PackageRegistry::new();
        let old = registry.register(0x1000, parse).unwrap();
        registry.release(old).unwrap();
        // The slab slot is reused with a new generation.
        let new = registry.register(0x2000, parse).unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(registry.get(old).is_err());
        assert_eq!(registry.release(old), Err(EdgeTpuError::NoSuchPackage));
        assert!(registry.get(new).is_ok());
    }

    #[test]
    fn parse_failure_stores_nothing() {
        let mut registry = PackageRegistry::new();
        assert_eq!(
            registry.register(0x1000, || Err(EdgeTpuError::InvalidPackage)),
            Err(EdgeTpuError::InvalidPackage)
        );
        assert!(registry.is_empty());
        // A later registration of the same buffer parses again.
        assert!(registry.register(0x1000, parse).is_ok());
    }
}
