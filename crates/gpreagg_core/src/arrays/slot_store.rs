use gpreagg_error::{DbError, Result};

use super::descriptor::{RowDescriptor, align_len};
use super::scalar::ScalarValue;
use crate::device::memory::DeviceCopy;

/// Location of an out of line value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarlenaPtr {
    /// Absolute device address. Only meaningful while the store is resident
    /// on the device it was written on.
    Device(u64),
    /// Offset into the extra area of the store.
    Host(u32),
}

#[derive(Debug, Clone, PartialEq)]
enum Datum {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Varlena { ptr: VarlenaPtr, len: u32 },
}

/// Row container in slot format.
///
/// Every row has one fixed width datum per column. Variable length values
/// are written to the extra area, and the datum points to it. Values written
/// while the store is resident on a device point at device addresses and have
/// to be fixed up before the store can be read on the host.
#[derive(Debug, Clone)]
pub struct SlotStore {
    ncols: usize,
    nrooms: usize,
    head_len: usize,
    row_len: usize,
    /// Datums for all rows, `nitems * ncols` long.
    datums: Vec<Datum>,
    /// Extra area for out of line values.
    extra: Vec<u8>,
    extra_capacity: usize,
    /// Base device address while the store is resident on a device.
    device_base: Option<u64>,
}

impl SlotStore {
    pub fn new(desc: &RowDescriptor, nrooms: usize, extra_capacity: usize) -> Self {
        SlotStore {
            ncols: desc.num_columns(),
            nrooms,
            head_len: desc.slot_head_len(),
            row_len: desc.slot_row_len(),
            datums: Vec::new(),
            extra: Vec::new(),
            extra_capacity: align_len(extra_capacity),
            device_base: None,
        }
    }

    /// Create an empty store with the same layout and the given capacity.
    pub fn with_capacity_of(&self, nrooms: usize, extra_capacity: usize) -> Self {
        SlotStore {
            ncols: self.ncols,
            nrooms,
            head_len: self.head_len,
            row_len: self.row_len,
            datums: Vec::new(),
            extra: Vec::new(),
            extra_capacity: align_len(extra_capacity),
            device_base: None,
        }
    }

    pub fn num_columns(&self) -> usize {
        self.ncols
    }

    pub fn nrooms(&self) -> usize {
        self.nrooms
    }

    /// Number of rows currently in the store.
    pub fn nitems(&self) -> usize {
        if self.ncols == 0 {
            return 0;
        }
        self.datums.len() / self.ncols
    }

    pub fn extra_usage(&self) -> usize {
        self.extra.len()
    }

    pub fn extra_capacity(&self) -> usize {
        self.extra_capacity
    }

    pub fn head_len(&self) -> usize {
        self.head_len
    }

    /// Total length of the store in bytes, including the extra area.
    pub fn length(&self) -> usize {
        self.extra_start() + self.extra_capacity
    }

    fn extra_start(&self) -> usize {
        self.head_len + self.row_len * self.nrooms
    }

    pub fn device_base(&self) -> Option<u64> {
        self.device_base
    }

    /// Mark this store as resident at `base` on a device.
    pub fn attach_device(&mut self, base: u64) {
        self.device_base = Some(base);
    }

    /// Mark this store as no longer resident on a device.
    pub fn detach_device(&mut self) {
        self.device_base = None;
    }

    /// If any out of line value points at a device address.
    pub fn has_device_pointers(&self) -> bool {
        self.datums.iter().any(|d| {
            matches!(
                d,
                Datum::Varlena {
                    ptr: VarlenaPtr::Device(_),
                    ..
                }
            )
        })
    }

    /// Bytes of extra space needed for storing `values`.
    pub fn extra_required(values: &[ScalarValue]) -> usize {
        values.iter().map(|v| align_len(v.varlena_len())).sum()
    }

    /// Bytes of extra space needed for overwriting `current` with `values`.
    ///
    /// Unchanged out of line values are not written again.
    pub fn changed_extra_required(current: &[ScalarValue], values: &[ScalarValue]) -> usize {
        current
            .iter()
            .zip(values)
            .filter(|(old, new)| new.varlena_len() > 0 && old != new)
            .map(|(_, new)| align_len(new.varlena_len()))
            .sum()
    }

    /// Check if there's room for `nrows` additional rows using `extra` bytes.
    pub fn has_room(&self, nrows: usize, extra: usize) -> bool {
        self.nitems() + nrows <= self.nrooms && self.extra.len() + extra <= self.extra_capacity
    }

    /// Append a row to the store.
    ///
    /// Returns `Ok(None)` if the store doesn't have room for the row,
    /// otherwise the index of the new row.
    pub fn append_row(&mut self, values: &[ScalarValue]) -> Result<Option<usize>> {
        self.check_num_values(values)?;
        if !self.has_room(1, Self::extra_required(values)) {
            return Ok(None);
        }

        let row_idx = self.nitems();
        for value in values {
            let datum = self.encode(value);
            self.datums.push(datum);
        }

        Ok(Some(row_idx))
    }

    /// Overwrite a row in the store.
    ///
    /// Returns `Ok(false)` without modifying the row if there isn't enough
    /// extra space for the changed out of line values.
    pub fn update_row(&mut self, row_idx: usize, values: &[ScalarValue]) -> Result<bool> {
        self.check_num_values(values)?;
        self.check_row_idx(row_idx)?;

        let current = self.row(row_idx)?;
        let required = Self::changed_extra_required(&current, values);
        if self.extra.len() + required > self.extra_capacity {
            return Ok(false);
        }

        for (col, (old, new)) in current.iter().zip(values).enumerate() {
            if old == new {
                continue;
            }
            let datum = self.encode(new);
            self.datums[row_idx * self.ncols + col] = datum;
        }

        Ok(true)
    }

    /// Read a row from the store.
    pub fn row(&self, row_idx: usize) -> Result<Vec<ScalarValue>> {
        self.check_row_idx(row_idx)?;
        let start = row_idx * self.ncols;
        self.datums[start..start + self.ncols]
            .iter()
            .map(|d| self.decode(d))
            .collect()
    }

    /// Read all rows from the store.
    pub fn rows(&self) -> Result<Vec<Vec<ScalarValue>>> {
        (0..self.nitems()).map(|idx| self.row(idx)).collect()
    }

    /// Rewrite device addresses of out of line values into offsets relative
    /// to the extra area.
    ///
    /// Returns the number of datums that were rewritten.
    pub fn fixup_varlena(&mut self) -> Result<usize> {
        let base = match self.device_base {
            Some(base) => base,
            None => {
                if self.has_device_pointers() {
                    return Err(DbError::new(
                        "Cannot fix up device pointers for store not resident on a device",
                    ));
                }
                return Ok(0);
            }
        };

        let extra_base = base + self.extra_start() as u64;
        let mut count = 0;
        for datum in &mut self.datums {
            if let Datum::Varlena { ptr, .. } = datum {
                if let VarlenaPtr::Device(addr) = *ptr {
                    let offset = addr.checked_sub(extra_base).ok_or_else(|| {
                        DbError::new("Device pointer outside of extra area")
                            .with_field("addr", addr)
                            .with_field("extra_base", extra_base)
                    })?;
                    *ptr = VarlenaPtr::Host(offset as u32);
                    count += 1;
                }
            }
        }

        Ok(count)
    }

    fn encode(&mut self, value: &ScalarValue) -> Datum {
        match value {
            ScalarValue::Null => Datum::Null,
            ScalarValue::Boolean(v) => Datum::Boolean(*v),
            ScalarValue::Int64(v) => Datum::Int64(*v),
            ScalarValue::Float64(v) => Datum::Float64(*v),
            ScalarValue::Utf8(v) => {
                let offset = self.extra.len();
                self.extra.extend_from_slice(v.as_bytes());
                self.extra.resize(offset + align_len(v.len()), 0);

                let ptr = match self.device_base {
                    Some(base) => VarlenaPtr::Device(base + (self.extra_start() + offset) as u64),
                    None => VarlenaPtr::Host(offset as u32),
                };

                Datum::Varlena {
                    ptr,
                    len: v.len() as u32,
                }
            }
        }
    }

    fn decode(&self, datum: &Datum) -> Result<ScalarValue> {
        Ok(match datum {
            Datum::Null => ScalarValue::Null,
            Datum::Boolean(v) => ScalarValue::Boolean(*v),
            Datum::Int64(v) => ScalarValue::Int64(*v),
            Datum::Float64(v) => ScalarValue::Float64(*v),
            Datum::Varlena { ptr, len } => {
                let offset = match (*ptr, self.device_base) {
                    (VarlenaPtr::Host(offset), _) => offset as usize,
                    (VarlenaPtr::Device(addr), Some(base)) => {
                        (addr.saturating_sub(base) as usize).saturating_sub(self.extra_start())
                    }
                    (VarlenaPtr::Device(addr), None) => {
                        return Err(DbError::new(
                            "Bug? Device pointer in host resident store, missing varlena fix-up",
                        )
                        .with_field("addr", addr));
                    }
                };

                let bytes = self
                    .extra
                    .get(offset..offset + *len as usize)
                    .ok_or_else(|| {
                        DbError::new("Out of line value outside of extra area")
                            .with_field("offset", offset)
                            .with_field("len", len)
                    })?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| DbError::with_source("Invalid utf8 in extra area", Box::new(e)))?;

                ScalarValue::Utf8(s.to_string())
            }
        })
    }

    fn check_num_values(&self, values: &[ScalarValue]) -> Result<()> {
        if values.len() != self.ncols {
            return Err(DbError::new("Unexpected number of values for slot store")
                .with_field("expected", self.ncols)
                .with_field("got", values.len()));
        }
        Ok(())
    }

    fn check_row_idx(&self, row_idx: usize) -> Result<()> {
        if row_idx >= self.nitems() {
            return Err(DbError::new("Row index out of bounds")
                .with_field("row_idx", row_idx)
                .with_field("nitems", self.nitems()));
        }
        Ok(())
    }
}

impl DeviceCopy for SlotStore {
    /// Only the header, the used rows and the used part of the extra area
    /// are transferred.
    fn transfer_len(&self) -> usize {
        self.head_len + self.row_len * self.nitems() + self.extra.len()
    }

    fn on_device(&mut self, addr: u64) {
        self.attach_device(addr);
    }

    fn on_host(&mut self) {
        self.detach_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::datatype::DataType;
    use crate::arrays::descriptor::{ColumnAction, ColumnDesc};

    fn key_count_desc() -> RowDescriptor {
        RowDescriptor::try_new([
            ColumnDesc::new("k", DataType::Utf8, ColumnAction::GroupingKey { input: 0 }),
            ColumnDesc::new("cnt", DataType::Int64, ColumnAction::NRows { input: None }),
        ])
        .unwrap()
    }

    #[test]
    fn append_until_full() {
        let mut store = SlotStore::new(&key_count_desc(), 2, 64);

        let idx = store
            .append_row(&["a".into(), ScalarValue::Int64(1)])
            .unwrap();
        assert_eq!(Some(0), idx);
        let idx = store
            .append_row(&["b".into(), ScalarValue::Int64(1)])
            .unwrap();
        assert_eq!(Some(1), idx);

        let idx = store
            .append_row(&["c".into(), ScalarValue::Int64(1)])
            .unwrap();
        assert_eq!(None, idx);
        assert_eq!(2, store.nitems());
    }

    #[test]
    fn append_out_of_extra_space() {
        let mut store = SlotStore::new(&key_count_desc(), 16, 8);

        let idx = store
            .append_row(&["too long for extra".into(), ScalarValue::Int64(1)])
            .unwrap();
        assert_eq!(None, idx);
        assert_eq!(0, store.nitems());
        assert_eq!(0, store.extra_usage());
    }

    #[test]
    fn device_pointers_require_fixup() {
        let mut store = SlotStore::new(&key_count_desc(), 4, 64);
        store.attach_device(0x10000);
        store
            .append_row(&["apple".into(), ScalarValue::Int64(3)])
            .unwrap();

        // Readable on the device.
        assert_eq!(
            vec![ScalarValue::from("apple"), ScalarValue::Int64(3)],
            store.row(0).unwrap()
        );

        // Copied back to the host without fixing up.
        let mut host = store.clone();
        host.detach_device();
        assert!(host.row(0).is_err());

        // Fix up on the device, then copy back.
        assert_eq!(1, store.fixup_varlena().unwrap());
        let mut host = store.clone();
        host.detach_device();
        assert_eq!(
            vec![ScalarValue::from("apple"), ScalarValue::Int64(3)],
            host.row(0).unwrap()
        );
    }

    #[test]
    fn update_row_keeps_unchanged_varlena() {
        let mut store = SlotStore::new(&key_count_desc(), 4, 16);
        store
            .append_row(&["pear".into(), ScalarValue::Int64(1)])
            .unwrap();
        let usage = store.extra_usage();

        let updated = store
            .update_row(0, &["pear".into(), ScalarValue::Int64(2)])
            .unwrap();
        assert!(updated);
        assert_eq!(usage, store.extra_usage());
        assert_eq!(ScalarValue::Int64(2), store.row(0).unwrap()[1]);
    }

    #[test]
    fn update_row_without_space() {
        let mut store = SlotStore::new(&key_count_desc(), 4, 8);
        store
            .append_row(&["pear".into(), ScalarValue::Int64(1)])
            .unwrap();

        let updated = store
            .update_row(0, &["peach".into(), ScalarValue::Int64(2)])
            .unwrap();
        assert!(!updated);
        assert_eq!(ScalarValue::Int64(1), store.row(0).unwrap()[1]);
    }
}
