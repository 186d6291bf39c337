/// Thread-local bump buffer used by GC threads to place evacuated copies.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tlab {
    top: usize,
    end: usize,
}

impl Tlab {
    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if self.top + size > self.end {
            return None;
        }
        let addr = self.top;
        self.top += size;
        Some(addr)
    }

    #[inline(always)]
    pub fn reset(&mut self, start: usize, end: usize) {
        self.top = start;
        self.end = end;
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.end - self.top
    }

    /// Detaches the unused tail so the caller can give it back.
    pub fn take_remaining(&mut self) -> Option<(usize, usize)> {
        let rest = (self.remaining() > 0).then_some((self.top, self.remaining()));
        *self = Self::default();
        rest
    }
}
