mod header;
mod layout;
mod mark_word;
mod value;

pub use header::{Header, ObjectType};
pub use layout::{
    FIELDS_OFFSET, HEADER_SIZE, MARK_WORD_OFFSET, MIN_OBJECT_SIZE, ObjectSlot, SlotKind, WORD_SIZE,
    align_to_word, bytes_allocation_size, copy_object, field_count, field_slot,
    fields_allocation_size, header_at, init_free, init_object, object_size, object_type,
    slot_kind, visit_object_slots,
};
pub use mark_word::MarkWord;
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-aligned scratch memory for laying out objects by hand.
    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, i64::MAX >> 1, i64::MIN >> 1] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert!(!v.is_header());
            assert_eq!(unsafe { v.to_i64() }, n);
        }
    }

    #[test]
    fn undefined_is_null_reference() {
        let v = Value::UNDEFINED;
        assert!(v.is_ref());
        assert!(v.is_undefined());
        assert!(!v.is_object());
        assert_eq!(v.addr(), 0);
        assert_eq!(Value::default(), Value::UNDEFINED);
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let addr = &dummy as *const u64 as usize;
        let v = Value::from_addr(addr);
        assert!(v.is_ref());
        assert!(v.is_object());
        assert!(!v.is_fixnum());
        assert_eq!(v.addr(), addr);
    }

    #[test]
    fn header_tag_detected() {
        let hdr = Header::new(ObjectType::Slots, 32);
        let raw = unsafe { *((&hdr) as *const Header as *const u64) };
        let v = Value::from_raw(raw);
        assert!(v.is_header());
        assert!(!v.is_fixnum());
        assert!(!v.is_ref());
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_object_type_and_size() {
        for (i, &ty) in [
            ObjectType::Slots,
            ObjectType::Array,
            ObjectType::ByteArray,
            ObjectType::Str,
            ObjectType::WeakCell,
            ObjectType::Code,
            ObjectType::Free,
        ]
        .iter()
        .enumerate()
        {
            let h = Header::new(ty, 8 * (i + 2));
            assert_eq!(h.object_type(), ty, "type mismatch at index {i}");
            assert_eq!(h.size(), 8 * (i + 2));
        }
    }

    #[test]
    fn reference_field_types() {
        assert!(ObjectType::Slots.has_reference_fields());
        assert!(ObjectType::WeakCell.has_reference_fields());
        assert!(!ObjectType::ByteArray.has_reference_fields());
        assert!(!ObjectType::Code.has_reference_fields());
        assert!(!ObjectType::Free.has_reference_fields());
    }

    // ── MarkWord ───────────────────────────────────────────────────

    #[test]
    fn mark_word_encoding() {
        assert_eq!(MarkWord::decode(0), MarkWord::Uninitialized);
        let fwd = MarkWord::Forwarded(0x1000);
        assert_eq!(MarkWord::decode(fwd.encode()), fwd);
        let hashed = MarkWord::Hashed(0xDEAD_BEEF);
        assert_eq!(MarkWord::decode(hashed.encode()), hashed);
        assert_eq!(fwd.forwarding_address(), Some(0x1000));
        assert_eq!(hashed.forwarding_address(), None);
    }

    #[test]
    fn mark_word_cas_single_winner() {
        let mut mem = scratch(4);
        let obj = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(obj, ObjectType::Slots, 32);
            let first = MarkWord::compare_exchange(obj, MarkWord::Uninitialized, MarkWord::Forwarded(0x40));
            assert!(first.is_ok());
            let second = MarkWord::compare_exchange(obj, MarkWord::Uninitialized, MarkWord::Forwarded(0x80));
            assert_eq!(second, Err(MarkWord::Forwarded(0x40)));
            assert_eq!(MarkWord::load(obj), MarkWord::Forwarded(0x40));
        }
    }

    #[test]
    fn hash_is_stable() {
        let mut mem = scratch(2);
        let obj = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(obj, ObjectType::ByteArray, 16);
            assert_eq!(MarkWord::hash_or_install(obj, 7), 7);
            assert_eq!(MarkWord::hash_or_install(obj, 9), 7);
        }
    }

    // ── Layout ─────────────────────────────────────────────────────

    #[test]
    fn allocation_sizes() {
        assert_eq!(fields_allocation_size(0), 16);
        assert_eq!(fields_allocation_size(3), 40);
        assert_eq!(bytes_allocation_size(1), 24);
        assert_eq!(bytes_allocation_size(8), 24);
        assert_eq!(bytes_allocation_size(9), 32);
    }

    #[test]
    fn init_object_fills_undefined() {
        let mut mem = scratch(5);
        let obj = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(obj, ObjectType::Array, fields_allocation_size(3));
            assert_eq!(object_size(obj), 40);
            assert_eq!(field_count(obj), 3);
            for i in 0..3 {
                assert_eq!(field_slot(obj, i).load(), Value::UNDEFINED);
            }
        }
    }

    #[test]
    fn weak_cell_first_slot_is_weak() {
        let mut mem = scratch(4);
        let obj = mem.as_mut_ptr() as usize;
        let mut kinds = Vec::new();
        unsafe {
            init_object(obj, ObjectType::WeakCell, fields_allocation_size(2));
            visit_object_slots(obj, &mut |slot, kind| kinds.push((slot, kind)));
        }
        assert_eq!(
            kinds,
            vec![
                (field_slot(obj, 0), SlotKind::Weak),
                (field_slot(obj, 1), SlotKind::Strong),
            ]
        );
    }

    #[test]
    fn byte_payload_is_not_visited() {
        let mut mem = scratch(4);
        let obj = mem.as_mut_ptr() as usize;
        let mut count = 0;
        unsafe {
            init_object(obj, ObjectType::ByteArray, bytes_allocation_size(16));
            visit_object_slots(obj, &mut |_, _| count += 1);
        }
        assert_eq!(count, 0);
    }

    #[test]
    fn one_word_free_filler() {
        let mut mem = scratch(1);
        let obj = mem.as_mut_ptr() as usize;
        unsafe {
            init_free(obj, 8);
            assert_eq!(object_type(obj), ObjectType::Free);
            assert_eq!(object_size(obj), 8);
        }
    }

    #[test]
    fn copy_keeps_hash() {
        let mut from = scratch(3);
        let mut to = scratch(3);
        let (a, b) = (from.as_mut_ptr() as usize, to.as_mut_ptr() as usize);
        unsafe {
            init_object(a, ObjectType::Slots, 24);
            field_slot(a, 0).store(Value::from_i64(5));
            copy_object(a, b, 24, Some(3));
            assert_eq!(object_type(b), ObjectType::Slots);
            assert_eq!(field_slot(b, 0).load(), Value::from_i64(5));
            assert_eq!(MarkWord::load(b), MarkWord::Hashed(3));
        }
    }

    #[test]
    fn slot_kind_finds_the_weak_cell_referent() {
        let mut mem = scratch(9);
        let cell = mem.as_mut_ptr() as usize;
        let slots = cell + fields_allocation_size(3);
        unsafe {
            init_object(cell, ObjectType::WeakCell, fields_allocation_size(3));
            init_object(slots, ObjectType::Slots, fields_allocation_size(2));
            MarkWord::hash_or_install(cell, 3);
            field_slot(cell, 2).store(Value::from_i64(-1));
            assert_eq!(slot_kind(field_slot(cell, 0)), SlotKind::Weak);
            assert_eq!(slot_kind(field_slot(cell, 1)), SlotKind::Strong);
            assert_eq!(slot_kind(field_slot(cell, 2)), SlotKind::Strong);
            assert_eq!(slot_kind(field_slot(slots, 0)), SlotKind::Strong);
            assert_eq!(slot_kind(field_slot(slots, 1)), SlotKind::Strong);
        }
    }
}
