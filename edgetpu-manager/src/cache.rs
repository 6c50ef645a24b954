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

//! Bookkeeping for the parameters resident in the accelerator's on-chip
//! memory. All packages sharing a caching token can be resident together,
//! up to PARAMETER_CACHE_SLOTS of them.

use edgetpu_shared::{PackageId, PARAMETER_CACHE_SLOTS};
use log::{info, trace};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheLookup {
    Hit,
    /// Parameters must be transferred and then installed in |slot|.
    Miss { slot: usize },
}

#[derive(Debug)]
pub struct ParameterCache {
    slots: [Option<PackageId>; PARAMETER_CACHE_SLOTS],
    resident_token: Option<u64>,
    generation: u64,
    next_victim: usize,
}
impl ParameterCache {
    pub const fn new() -> Self {
        ParameterCache {
            slots: [None; PARAMETER_CACHE_SLOTS],
            resident_token: None,
            generation: 0,
            next_victim: 0,
        }
    }

    /// Decides whether |id|'s parameters, compiled under |token|, are on
    /// chip. On a miss the returned slot is already empty so a failed
    /// transfer leaves nothing behind.
    pub fn lookup(&mut self, id: PackageId, token: u64) -> CacheLookup {
        if self.resident_token != Some(token) {
            trace!("Token {:#x} replaces {:x?}", token, self.resident_token);
            self.invalidate();
            return CacheLookup::Miss { slot: 0 };
        }
        if self.slots.contains(&Some(id)) {
            return CacheLookup::Hit;
        }
        if let Some(slot) = self.slots.iter().position(|s| s.is_none()) {
            return CacheLookup::Miss { slot };
        }
        let slot = self.next_victim;
        self.next_victim = (slot + 1) % PARAMETER_CACHE_SLOTS;
        trace!("Evicting {:?} from slot {}", self.slots[slot], slot);
        self.slots[slot] = None;
        CacheLookup::Miss { slot }
    }

    /// Records a completed parameter transfer.
    pub fn install(&mut self, slot: usize, id: PackageId, token: u64) {
        self.slots[slot] = Some(id);
        self.resident_token = Some(token);
        self.generation += 1;
    }

    /// Forgets everything; on-chip parameters are no longer trusted.
    pub fn invalidate(&mut self) {
        self.slots = [None; PARAMETER_CACHE_SLOTS];
        self.resident_token = None;
        self.next_victim = 0;
        self.generation += 1;
    }

    /// Drops |id| from the table without touching the others.
    pub fn evict(&mut self, id: PackageId) {
        for slot in self.slots.iter_mut().filter(|s| **s == Some(id)) {
            *slot = None;
        }
    }

    pub fn resident_token(&self) -> Option<u64> { self.resident_token }
    pub fn generation(&self) -> u64 { self.generation }
    pub fn slots(&self) -> &[Option<PackageId>] { &self.slots }

    pub fn debug_state(&self) {
        info!(target: "",
            "Parameter cache: token {:x?} generation {} slots {:?}",
            self.resident_token,
            self.generation,
            self.slots
        );
    }
}
impl Default for ParameterCache {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: usize) -> PackageId { PackageId { index, generation: 0 } }

    // Runs a lookup and installs on a miss, as a successful invoke would.
    fn use_package(cache: &mut ParameterCache, index: usize, token: u64) -> bool {
        match cache.lookup(id(index), token) {
            CacheLookup::Hit => false,
            CacheLookup::Miss { slot } => {
                cache.install(slot, id(index), token);
                true
            }
        }
    }

    #[test]
    fn hit_after_install() {
        let mut cache = ParameterCache::new();
        assert!(use_package(&mut cache, 0, 7));
        let generation = cache.generation();
        assert!(!use_package(&mut cache, 0, 7));
        assert_eq!(cache.generation(), generation);
    }

    #[test]
    fn two_packages_share_a_token() {
        let mut cache = ParameterCache::new();
        assert!(use_package(&mut cache, 0, 7));
        assert!(use_package(&mut cache, 1, 7));
        assert!(!use_package(&mut cache, 0, 7));
        assert!(!use_package(&mut cache, 1, 7));
        assert_eq!(cache.slots(), &[Some(id(0)), Some(id(1))]);
    }

    #[test]
    fn new_token_flushes() {
        let mut cache = ParameterCache::new();
        use_package(&mut cache, 0, 7);
        use_package(&mut cache, 1, 7);
        assert!(use_package(&mut cache, 2, 8));
        assert_eq!(cache.slots(), &[Some(id(2)), None]);
        assert_eq!(cache.resident_token(), Some(8));
        assert!(use_package(&mut cache, 0, 7));
    }

    #[test]
    fn round_robin_of_three_always_misses() {
        let mut cache = ParameterCache::new();
        for _ in 0..3 {
            for index in 0..3 {
                assert!(use_package(&mut cache, index, 7));
            }
        }
        // Never more than two resident, never a duplicate.
        let resident: usize = cache.slots().iter().flatten().count();
        assert_eq!(resident, 2);
        assert_ne!(cache.slots()[0], cache.slots()[1]);
    }

    #[test]
    fn miss_without_install_leaves_slot_empty() {
        let mut cache = ParameterCache::new();
        use_package(&mut cache, 0, 7);
        use_package(&mut cache, 1, 7);
        // A transfer for package 2 fails after the victim was chosen.
        assert_eq!(cache.lookup(id(2), 7), CacheLookup::Miss { slot: 0 });
        assert_eq!(cache.slots(), &[None, Some(id(1))]);
        // Package 0 was the victim and must be transferred again.
        assert_eq!(cache.lookup(id(0), 7), CacheLookup::Miss { slot: 0 });
    }

    #[test]
    fn invalidate_and_evict() {
        let mut cache = ParameterCache::new();
        use_package(&mut cache, 0, 7);
        use_package(&mut cache, 1, 7);
        cache.evict(id(0));
        assert_eq!(cache.slots(), &[None, Some(id(1))]);
        let generation = cache.generation();
        cache.invalidate();
        assert_eq!(cache.resident_token(), None);
        assert!(cache.generation() > generation);
        assert!(use_package(&mut cache, 1, 7));
    }
}
