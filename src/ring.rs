use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher24;

use crate::Error;

/// Immutable slot-to-backend table built with Maglev permutation hashing.
///
/// Every node that builds an `Assignment` from the same backend set and table
/// size gets an identical table, with no coordination beyond agreeing on the
/// inputs. Membership changes never mutate an existing table; callers rebuild
/// from the updated set and swap the result in wholesale, which is what gives
/// Maglev its minimal-disruption property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Lexicographically sorted backend identifiers.
    backends: Vec<String>,
    /// One entry per slot, indexing into `backends`.
    table: Vec<usize>,
}

impl Assignment {
    /// Build the full table for `backend_ids` over `table_size` slots.
    ///
    /// Each backend hashes to a preference permutation over all slots
    /// (`offset` from one hash function, `skip` from an independent one; the
    /// table size being prime makes every skip coprime to it, so the
    /// permutation visits every slot). Backends then claim slots greedily in
    /// rounds, one slot per backend per round, in lexicographic order of
    /// identifier. The claiming order is pinned so that every node in the
    /// cluster resolves hash collisions identically.
    ///
    /// # Errors
    ///
    /// `EmptyBackendSet` if no backends were given, `InvalidRingSize` if
    /// `table_size` is not prime or does not exceed the backend count.
    pub fn build<I, S>(backend_ids: I, table_size: usize) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backends: BTreeSet<String> = backend_ids.into_iter().map(Into::into).collect();
        if backends.is_empty() {
            return Err(Error::EmptyBackendSet);
        }
        if !is_prime(table_size) {
            return Err(Error::InvalidRingSize {
                m: table_size,
                reason: "table size must be prime",
            });
        }
        if table_size <= backends.len() {
            return Err(Error::InvalidRingSize {
                m: table_size,
                reason: "table size must exceed the backend count",
            });
        }

        let backends: Vec<String> = backends.into_iter().collect();
        let m = table_size as u64;
        let permutations: Vec<(u64, u64)> = backends
            .iter()
            .map(|id| (fnv1a(id) % m, 1 + sip24(id) % (m - 1)))
            .collect();

        let mut cursors = vec![0u64; backends.len()];
        let mut table = vec![usize::MAX; table_size];
        let mut unclaimed = table_size;

        'rounds: loop {
            for (backend, &(offset, skip)) in permutations.iter().enumerate() {
                // Advance this backend's cursor to its next unclaimed
                // preferred slot. Terminates because the permutation covers
                // all slots and at least one is still unclaimed.
                let slot = loop {
                    let candidate = ((offset + cursors[backend] * skip) % m) as usize;
                    cursors[backend] += 1;
                    if table[candidate] == usize::MAX {
                        break candidate;
                    }
                };
                table[slot] = backend;
                unclaimed -= 1;
                if unclaimed == 0 {
                    break 'rounds;
                }
            }
        }

        Ok(Self { backends, table })
    }

    /// Owner of the slot a key hashes to.
    pub fn lookup(&self, key: &str) -> &str {
        let slot = (fnv1a(key) % self.table.len() as u64) as usize;
        self.owner(slot)
    }

    /// Owner of a specific slot. Panics if `slot >= table_size()`.
    pub fn owner(&self, slot: usize) -> &str {
        &self.backends[self.table[slot]]
    }

    /// All slots owned by the given backend. Empty if the backend is not in
    /// the table.
    pub fn slots_owned_by(&self, backend_id: &str) -> BTreeSet<usize> {
        let Some(index) = self.backends.iter().position(|b| b == backend_id) else {
            return BTreeSet::new();
        };
        self.table
            .iter()
            .enumerate()
            .filter(|(_, &owner)| owner == index)
            .map(|(slot, _)| slot)
            .collect()
    }

    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }
}

/// Primality by trial division. Table sizes are small (tens to low
/// thousands), so nothing fancier is warranted.
pub fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[inline]
fn fnv1a(key: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[inline]
fn sip24(key: &str) -> u64 {
    let mut hasher = SipHasher24::new();
    key.hash(&mut hasher);
    hasher.finish()
}
