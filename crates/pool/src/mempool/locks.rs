// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

use std::hash::{BuildHasher, RandomState};

use parking_lot::{Mutex, MutexGuard};

/// A fixed set of mutexes addressed by hashing a key.
///
/// Two keys may share a stripe; that only serializes them.
#[derive(Debug)]
pub(crate) struct StripedLocks {
    stripes: Vec<Mutex<()>>,
    hasher: RandomState,
}

impl StripedLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn index(&self, key: &[u8]) -> usize {
        (self.hasher.hash_one(key) % self.stripes.len() as u64) as usize
    }

    pub(crate) fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.stripes[self.index(key)].lock()
    }

    /// Locks the stripes of every key, each once, in ascending stripe order.
    ///
    /// Callers that hold more than one stripe must come through here.
    pub(crate) fn lock_many<'a, I, K>(&self, keys: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = &'a K>,
        K: AsRef<[u8]> + ?Sized + 'a,
    {
        let mut indexes: Vec<usize> = keys.into_iter().map(|k| self.index(k.as_ref())).collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes.into_iter().map(|i| self.stripes[i].lock()).collect()
    }

    /// Locks every stripe in ascending order
    pub(crate) fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.stripes.iter().map(|stripe| stripe.lock()).collect()
    }

    /// Whether `key`'s stripe is among those `lock_many` would take for `keys`
    pub(crate) fn covers<'a, I, K>(&self, keys: I, key: &[u8]) -> bool
    where
        I: IntoIterator<Item = &'a K>,
        K: AsRef<[u8]> + ?Sized + 'a,
    {
        let wanted = self.index(key);
        keys.into_iter().any(|k| self.index(k.as_ref()) == wanted)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn lock_many_dedups_shared_stripes() {
        let locks = StripedLocks::new(1);
        let keys = [[1u8; 20], [2u8; 20]];
        // both keys map to the only stripe, locking it twice would deadlock
        let guards = locks.lock_many(keys.iter());
        assert_eq!(guards.len(), 1);
        assert!(locks.covers(keys.iter(), &[9u8; 20]));
    }

    #[test]
    fn lock_all_excludes_every_key() {
        let locks = Arc::new(StripedLocks::new(4));
        let guards = locks.lock_all();
        assert_eq!(guards.len(), 4);

        let other = locks.clone();
        let waiter = thread::spawn(move || {
            let _guard = other.lock(b"anything");
        });
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(guards);
        waiter.join().unwrap();
    }

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(StripedLocks::new(16));
        let counter = Arc::new(Mutex::new(0u32));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = locks.lock(b"sender");
                        let mut c = counter.lock();
                        *c += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 800);
    }
}
