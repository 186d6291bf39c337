/// Tag constants.
const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;
const HEADER_TAG: u64 = 0b11;

/// A tagged 64-bit value.
///
/// Encoding:
/// - **Fixnum**:    `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **Reference**: `...XXXX01`: heap address (mask low 2 bits; objects are 8-byte aligned).
/// - **Header**:    `...XXXX11`: only valid as the first word of a heap object.
///
/// The reference with a zero address is `Undefined`. Weak slots are cleared
/// to it when their referent dies.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const UNDEFINED: Value = Value(REF_TAG);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "fixnum overflow: {n}"
        );
        Self((n << 1) as u64)
    }

    /// # Safety
    ///
    /// The value must be a fixnum.
    #[inline(always)]
    pub unsafe fn to_i64(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.0 as i64) >> 1
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub const fn is_undefined(self) -> bool {
        self.0 == REF_TAG
    }

    /// A reference to an actual heap object (not `Undefined`).
    #[inline(always)]
    pub const fn is_object(self) -> bool {
        self.is_ref() && !self.is_undefined()
    }

    #[inline(always)]
    pub fn from_addr(addr: usize) -> Self {
        debug_assert!(addr as u64 & TAG_MASK == 0, "address not aligned");
        Self(addr as u64 | REF_TAG)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::from_addr(ptr as usize)
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        (self.0 & !TAG_MASK) as usize
    }

    #[inline(always)]
    pub const fn is_header(self) -> bool {
        self.0 & TAG_MASK == HEADER_TAG
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_fixnum() {
            write!(f, "Fixnum({})", unsafe { self.to_i64() })
        } else if self.is_undefined() {
            write!(f, "Undefined")
        } else if self.is_ref() {
            write!(f, "Ref(0x{:x})", self.addr())
        } else {
            write!(f, "Header(0x{:016x})", self.0)
        }
    }
}
