/// MSB-first bit reader over a byte slice.
///
/// Reads past the end of the input yield zero bits; callers check
/// [`overflow`](BitReader::overflow) after a decode pass instead of
/// handling an error on every read.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    next_byte: usize,
    bitbuf: u64,
    bitcount: u32,
    consumed: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next_byte: 0,
            bitbuf: 0,
            bitcount: 0,
            consumed: 0,
        }
    }

    fn fill(&mut self, want: u32) {
        while self.bitcount < want {
            let byte = self.data.get(self.next_byte).copied().unwrap_or(0);
            self.next_byte += 1;
            self.bitbuf |= u64::from(byte) << (56 - self.bitcount);
            self.bitcount += 8;
        }
    }

    /// Returns the next `numbits` bits without consuming them.
    ///
    /// `numbits` must be at most 32.
    pub fn peek(&mut self, numbits: u32) -> u32 {
        debug_assert!(numbits <= 32);
        if numbits == 0 {
            return 0;
        }
        self.fill(numbits);
        (self.bitbuf >> (64 - numbits)) as u32
    }

    /// Consumes `numbits` bits.
    pub fn consume(&mut self, numbits: u32) {
        if numbits == 0 {
            return;
        }
        self.fill(numbits);
        self.bitbuf <<= numbits;
        self.bitcount -= numbits;
        self.consumed += u64::from(numbits);
    }

    /// Reads and consumes `numbits` bits.
    pub fn read(&mut self, numbits: u32) -> u32 {
        let value = self.peek(numbits);
        self.consume(numbits);
        value
    }

    /// True once more bits have been consumed than the input holds.
    pub fn overflow(&self) -> bool {
        self.consumed > self.data.len() as u64 * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_msb_first() {
        // 0b1011_0010 0b1100_0001
        let mut reader = BitReader::new(&[0xb2, 0xc1]);
        assert_eq!(reader.read(1), 1);
        assert_eq!(reader.read(3), 0b011);
        assert_eq!(reader.read(4), 0b0010);
        assert_eq!(reader.read(8), 0xc1);
        assert!(!reader.overflow());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut reader = BitReader::new(&[0xff, 0x00]);
        assert_eq!(reader.peek(4), 0xf);
        assert_eq!(reader.peek(8), 0xff);
        assert_eq!(reader.read(8), 0xff);
    }

    #[test]
    fn reading_past_end_sets_overflow() {
        let mut reader = BitReader::new(&[0xaa]);
        assert_eq!(reader.read(8), 0xaa);
        assert!(!reader.overflow());
        assert_eq!(reader.read(4), 0);
        assert!(reader.overflow());
    }

    #[test]
    fn zero_width_read_is_zero() {
        let mut reader = BitReader::new(&[]);
        assert_eq!(reader.read(0), 0);
        assert!(!reader.overflow());
    }

    #[test]
    fn spans_byte_boundaries() {
        let mut reader = BitReader::new(&[0x12, 0x34, 0x56, 0x78, 0x9a]);
        assert_eq!(reader.read(12), 0x123);
        assert_eq!(reader.read(24), 0x456789);
        assert_eq!(reader.read(4), 0xa);
    }
}
