use crate::error::Error;

/// Initial buffer capacity, in units.
pub const INIT_UNITS: usize = 8;

/// Hard ceiling on buffer capacity in bytes; growth past this is fatal.
pub const MAX_BUF_BYTES: usize = 1 << 24;

/// A circular byte buffer holding messages of one fixed unit size.
///
/// The read cursor is `next`; `unread` bytes of valid data follow it,
/// wrapping modulo the capacity. Capacity doubles when full and halves
/// (compacting) when occupancy falls to a quarter, never below the
/// initial size.
#[derive(Debug)]
pub struct CircBuf {
    unit_sz: usize,
    next: usize,
    unread: usize,
    data: Vec<u8>,
}

impl CircBuf {
    pub fn new(unit_sz: usize) -> Self {
        assert!(unit_sz > 0, "circular buffer needs a nonzero unit size");
        CircBuf {
            unit_sz,
            next: 0,
            unread: 0,
            data: vec![0; INIT_UNITS * unit_sz],
        }
    }

    pub fn unit_sz(&self) -> usize {
        self.unit_sz
    }

    pub fn unread_bytes(&self) -> usize {
        self.unread
    }

    pub fn unread_units(&self) -> usize {
        self.unread / self.unit_sz
    }

    pub fn is_empty(&self) -> bool {
        self.unread == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Copy all unread bytes, in order, into the front of `dst`.
    fn compact_into(&self, dst: &mut [u8]) {
        let alloc = self.data.len();
        let first = (alloc - self.next).min(self.unread);
        dst[..first].copy_from_slice(&self.data[self.next..self.next + first]);
        let rest = self.unread - first;
        dst[first..self.unread].copy_from_slice(&self.data[..rest]);
    }

    fn resize(&mut self, new_alloc: usize) {
        let mut new_data = vec![0; new_alloc];
        self.compact_into(&mut new_data);
        self.next = 0;
        self.data = new_data;
    }

    /// Append one unit. Doubles the capacity when full; refuses to grow
    /// past [`MAX_BUF_BYTES`].
    pub fn push(&mut self, src: &[u8]) -> Result<(), Error> {
        assert_eq!(src.len(), self.unit_sz);
        if self.unread == self.data.len() {
            if self.data.len() * 2 > MAX_BUF_BYTES {
                return Err(Error::ChannelOverflow { max: MAX_BUF_BYTES });
            }
            self.resize(self.data.len() * 2);
        }
        // Capacity is always a whole number of units, so a unit never
        // straddles the wrap point.
        let at = (self.next + self.unread) % self.data.len();
        self.data[at..at + self.unit_sz].copy_from_slice(src);
        self.unread += self.unit_sz;
        Ok(())
    }

    /// Remove the oldest unit into `dst`, shrinking the buffer when
    /// occupancy has fallen to a quarter of a larger-than-initial
    /// capacity.
    pub fn shift(&mut self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.unit_sz);
        assert!(self.unread >= self.unit_sz, "shift on empty buffer");
        dst.copy_from_slice(&self.data[self.next..self.next + self.unit_sz]);
        self.next = (self.next + self.unit_sz) % self.data.len();
        self.unread -= self.unit_sz;

        let alloc = self.data.len();
        if self.unread <= alloc / 4 && alloc > INIT_UNITS * self.unit_sz {
            self.resize(alloc / 2);
        }
    }

    /// ABI-edge variant of [`CircBuf::push`]: `src` must point at one
    /// readable unit of guest memory.
    pub unsafe fn push_raw(&mut self, src: *const u8) -> Result<(), Error> {
        self.push(std::slice::from_raw_parts(src, self.unit_sz))
    }

    /// ABI-edge variant of [`CircBuf::shift`]: `dst` must point at one
    /// writable unit of guest memory.
    pub unsafe fn shift_raw(&mut self, dst: *mut u8) {
        self.shift(std::slice::from_raw_parts_mut(dst, self.unit_sz))
    }
}
