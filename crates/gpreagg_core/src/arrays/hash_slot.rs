use gpreagg_error::{DbError, Result};

use crate::device::memory::DeviceCopy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// The hash value for this entry.
    pub hash: u64,
    /// Index of the row in the associated slot store.
    ///
    /// None if this slot isn't occupied.
    pub row: Option<u32>,
}

impl Entry {
    const ZERO: Self = Entry { hash: 0, row: None };
}

/// Open addressing hash slot array mapping hashes to rows in a slot store.
///
/// The slot array never resizes, it's sized up front from the capacity of the
/// store it indexes.
#[derive(Debug, Clone)]
pub struct HashSlot {
    /// Number of occupied entries.
    num_occupied: usize,
    entries: Vec<Entry>,
}

impl HashSlot {
    const LOAD_NUM: usize = 7;
    const LOAD_DEN: usize = 10;

    /// Length of a single entry in bytes.
    pub const ENTRY_LEN: usize = 16;

    /// Create a hash slot able to index `nrooms` rows without exceeding the
    /// load factor.
    pub fn try_for_rooms(nrooms: usize) -> Result<Self> {
        let capacity = Self::capacity_for_rooms(nrooms)?;
        Ok(HashSlot {
            num_occupied: 0,
            entries: vec![Entry::ZERO; capacity],
        })
    }

    /// Compute the slot capacity for indexing `nrooms` rows.
    pub fn capacity_for_rooms(nrooms: usize) -> Result<usize> {
        // Entries store row indices as u32.
        if nrooms > u32::MAX as usize {
            return Err(DbError::new("Too many rooms for hash slot").with_field("nrooms", nrooms));
        }
        let min = (nrooms * Self::LOAD_DEN).div_ceil(Self::LOAD_NUM).max(1);
        min.checked_next_power_of_two().ok_or_else(|| {
            DbError::new("Requested capacity for hash slot too high").with_field("nrooms", nrooms)
        })
    }

    /// Length in bytes of a hash slot that indexes `nrooms` rows.
    pub fn length_for_rooms(nrooms: usize) -> Result<usize> {
        Ok(Self::capacity_for_rooms(nrooms)? * Self::ENTRY_LEN)
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn num_occupied(&self) -> usize {
        self.num_occupied
    }

    /// Clear all entries.
    pub fn reset(&mut self) {
        self.entries.fill(Entry::ZERO);
        self.num_occupied = 0;
    }

    /// Find the row for a hash value, using `matches` to compare candidate
    /// rows with the same hash.
    pub fn find<F>(&self, hash: u64, mut matches: F) -> Result<Option<usize>>
    where
        F: FnMut(usize) -> Result<bool>,
    {
        let cap = self.capacity();
        let mut offset = compute_offset_from_hash(hash, cap as u64) as usize;

        for _ in 0..cap {
            let ent = &self.entries[offset];
            match ent.row {
                None => return Ok(None),
                Some(row) => {
                    if ent.hash == hash && matches(row as usize)? {
                        return Ok(Some(row as usize));
                    }
                }
            }
            offset = inc_and_wrap_offset(offset, cap);
        }

        Ok(None)
    }

    /// Insert a new entry.
    ///
    /// The caller must have checked that no matching entry exists.
    pub fn insert(&mut self, hash: u64, row: usize) -> Result<()> {
        if self.num_occupied + 1 > self.capacity() {
            return Err(DbError::new("Hash slot full").with_field("capacity", self.capacity()));
        }

        let row = u32::try_from(row).map_err(|_| {
            DbError::new("Row index out of range for hash slot").with_field("row", row)
        })?;

        let cap = self.capacity();
        let mut offset = compute_offset_from_hash(hash, cap as u64) as usize;
        // Continue to try to insert until we find an empty slot.
        loop {
            if self.entries[offset].row.is_none() {
                self.entries[offset] = Entry {
                    hash,
                    row: Some(row),
                };
                self.num_occupied += 1;
                return Ok(());
            }
            offset = inc_and_wrap_offset(offset, cap);
        }
    }
}

impl DeviceCopy for HashSlot {
    fn transfer_len(&self) -> usize {
        self.entries.len() * Self::ENTRY_LEN
    }
}

/// Increment offset by one, wrapping around if necessary.
///
/// Requires that `cap` be a power of 2.
pub const fn inc_and_wrap_offset(offset: usize, cap: usize) -> usize {
    (offset + 1) & (cap - 1)
}

/// Compute the initial offset using a hash.
///
/// Requires that `cap` be a power of 2.
pub const fn compute_offset_from_hash(hash: u64, cap: u64) -> u64 {
    hash & (cap - 1)
}
