//! Object layout queries.
//!
//! Every object is `[Header][MarkWord][fields...]` and 8-byte aligned. Objects
//! with reference fields store one tagged [`Value`] per field word. A `Free`
//! filler may be a single header word so that any gap can be plugged.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Header, MarkWord, ObjectType, Value};

pub const WORD_SIZE: usize = 8;
pub const HEADER_SIZE: usize = 8;
pub const MARK_WORD_OFFSET: usize = 8;
pub const FIELDS_OFFSET: usize = 16;
/// Smallest real object: header plus mark word.
pub const MIN_OBJECT_SIZE: usize = FIELDS_OFFSET;

#[inline(always)]
pub const fn align_to_word(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Allocation size of an object with `count` tagged fields.
#[inline(always)]
pub const fn fields_allocation_size(count: usize) -> usize {
    FIELDS_OFFSET + count * WORD_SIZE
}

/// Allocation size of an object with a `len`-byte raw payload.
#[inline(always)]
pub const fn bytes_allocation_size(len: usize) -> usize {
    FIELDS_OFFSET + align_to_word(len)
}

/// An address of one tagged field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectSlot(pub usize);

impl ObjectSlot {
    #[inline(always)]
    pub fn address(self) -> usize {
        self.0
    }

    #[inline(always)]
    fn cell<'a>(self) -> &'a AtomicU64 {
        // SAFETY: slots are only created for word-aligned fields of live
        // objects or for root storage that outlives the visit.
        unsafe { &*(self.0 as *const AtomicU64) }
    }

    #[inline(always)]
    pub fn load(self) -> Value {
        Value::from_raw(self.cell().load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn store(self, value: Value) {
        self.cell().store(value.raw(), Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Strong,
    Weak,
}

/// # Safety
///
/// `addr` must point to an initialized object header.
#[inline(always)]
pub unsafe fn header_at<'a>(addr: usize) -> &'a Header {
    unsafe { &*(addr as *const Header) }
}

/// # Safety
///
/// `addr` must point to an initialized object header.
#[inline(always)]
pub unsafe fn object_size(addr: usize) -> usize {
    unsafe { header_at(addr) }.size()
}

/// # Safety
///
/// `addr` must point to an initialized object header.
#[inline(always)]
pub unsafe fn object_type(addr: usize) -> ObjectType {
    unsafe { header_at(addr) }.object_type()
}

/// Kind of a reference field known only by its address.
///
/// Field 0 is the only field whose word `FIELDS_OFFSET` bytes back is a
/// header; the mark word and reference fields are never header-tagged.
///
/// # Safety
///
/// `slot` must be a reference field of an initialized object.
pub unsafe fn slot_kind(slot: ObjectSlot) -> SlotKind {
    let holder = slot.address() - FIELDS_OFFSET;
    let first = ObjectSlot(holder).load();
    if first.is_header() && unsafe { object_type(holder) } == ObjectType::WeakCell {
        SlotKind::Weak
    } else {
        SlotKind::Strong
    }
}

#[inline(always)]
pub fn field_slot(addr: usize, index: usize) -> ObjectSlot {
    ObjectSlot(addr + FIELDS_OFFSET + index * WORD_SIZE)
}

/// # Safety
///
/// `addr` must point to an initialized object header.
#[inline(always)]
pub unsafe fn field_count(addr: usize) -> usize {
    let header = unsafe { header_at(addr) };
    if header.has_reference_fields() {
        (header.size() - FIELDS_OFFSET) / WORD_SIZE
    } else {
        0
    }
}

/// Writes a fresh object into `size` bytes at `addr`. Tagged fields start
/// out as `Undefined`, raw payloads as zero.
///
/// # Safety
///
/// `addr..addr + size` must be writable memory not shared with other threads.
pub unsafe fn init_object(addr: usize, object_type: ObjectType, size: usize) {
    debug_assert!(size >= MIN_OBJECT_SIZE);
    debug_assert_ne!(object_type, ObjectType::Free);
    unsafe {
        (addr as *mut Header).write(Header::new(object_type, size));
        (addr as *mut u64).add(1).write(MarkWord::Uninitialized.encode());
        let fields = (addr + FIELDS_OFFSET) as *mut u64;
        let words = (size - FIELDS_OFFSET) / WORD_SIZE;
        let fill = if object_type.has_reference_fields() {
            Value::UNDEFINED.raw()
        } else {
            0
        };
        for i in 0..words {
            fields.add(i).write(fill);
        }
    }
}

/// Plugs `size` bytes at `addr` with a `Free` filler.
///
/// # Safety
///
/// `addr..addr + size` must be writable memory that no live object uses.
pub unsafe fn init_free(addr: usize, size: usize) {
    debug_assert!(size >= WORD_SIZE && size.is_multiple_of(WORD_SIZE));
    unsafe {
        (addr as *mut Header).write(Header::new(ObjectType::Free, size));
        if size >= MIN_OBJECT_SIZE {
            (addr as *mut u64).add(1).write(MarkWord::Uninitialized.encode());
        }
    }
}

/// Copies header and body of `from` to `to`. The mark word of the copy
/// starts out `Uninitialized`, or carries `hash` when the object had one.
///
/// # Safety
///
/// Both ranges must be `size` bytes, non-overlapping, and `to` must be
/// exclusively owned by the caller.
pub unsafe fn copy_object(from: usize, to: usize, size: usize, hash: Option<u32>) {
    unsafe {
        std::ptr::copy_nonoverlapping(from as *const u8, to as *mut u8, HEADER_SIZE);
        std::ptr::copy_nonoverlapping(
            (from + FIELDS_OFFSET) as *const u8,
            (to + FIELDS_OFFSET) as *mut u8,
            size - FIELDS_OFFSET,
        );
        let word = hash.map_or(MarkWord::Uninitialized, MarkWord::Hashed);
        (to as *mut u64).add(1).write(word.encode());
    }
}

/// Calls `visitor` for every tagged field of the object at `addr`.
///
/// This is the default trace function used by the heap.
///
/// # Safety
///
/// `addr` must point to an initialized, non-forwarded object.
pub unsafe fn visit_object_slots(addr: usize, visitor: &mut dyn FnMut(ObjectSlot, SlotKind)) {
    let header = unsafe { header_at(addr) };
    if !header.has_reference_fields() {
        return;
    }
    let count = (header.size() - FIELDS_OFFSET) / WORD_SIZE;
    let weak_fields = usize::from(header.object_type() == ObjectType::WeakCell);
    for i in 0..count {
        let kind = if i < weak_fields { SlotKind::Weak } else { SlotKind::Strong };
        visitor(field_slot(addr, i), kind);
    }
}
