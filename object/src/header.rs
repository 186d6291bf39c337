/// Object type tag stored in bits 2..7 of the header's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    /// Fixed set of tagged fields.
    Slots = 0,
    /// Variable number of tagged fields.
    Array,
    /// Raw bytes, never traced.
    ByteArray,
    Str,
    /// First field is held weakly, the remaining fields strongly.
    WeakCell,
    /// Machine code payload, never traced.
    Code,
    /// Filler for dead or abandoned memory. May be a single word.
    Free,
}

impl ObjectType {
    pub const COUNT: usize = Self::Free as usize + 1;

    /// Whether objects of this type carry tagged fields the GC must trace.
    #[inline(always)]
    pub const fn has_reference_fields(self) -> bool {
        matches!(self, Self::Slots | Self::Array | Self::WeakCell)
    }
}

const HEADER_TAG: u8 = 0b11;

/// The 8-byte header at the start of every heap object.
///
/// ```text
/// byte 0:    [tag:2 = 0b11] [object_type:6]
/// bytes 1‥3: reserved (zero)
/// bytes 4‥7: object size in words, header included
/// ```
///
/// On little-endian systems, reading these 8 bytes as a `u64` yields a
/// value whose low 2 bits are `0b11`, which [`crate::Value::is_header`] detects.
/// The header is written once when the object is initialized and copied
/// verbatim when it is evacuated, so plain fields are enough.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Header {
    tag_and_type: u8,
    _reserved: [u8; 3],
    size_words: u32,
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(object_type: ObjectType, size: usize) -> Self {
        debug_assert!(size.is_multiple_of(8), "object size not word aligned");
        debug_assert!(size / 8 <= u32::MAX as usize, "object too large");
        Self {
            tag_and_type: ((object_type as u8) << 2) | HEADER_TAG,
            _reserved: [0; 3],
            size_words: (size / 8) as u32,
        }
    }

    #[inline(always)]
    pub fn object_type(&self) -> ObjectType {
        let raw = self.tag_and_type >> 2;
        debug_assert!((raw as usize) < ObjectType::COUNT);
        unsafe { core::mem::transmute::<u8, ObjectType>(raw) }
    }

    /// Object size in bytes, header included.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size_words as usize * 8
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.object_type() == ObjectType::Free
    }

    #[inline(always)]
    pub fn has_reference_fields(&self) -> bool {
        self.object_type().has_reference_fields()
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.object_type())
            .field("size", &self.size())
            .finish()
    }
}
