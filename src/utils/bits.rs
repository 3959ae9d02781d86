use crate::error::{Result, TsError};

/// A bit-level reader for big-endian fields of section and PES headers.
///
/// Bits are fetched from the borrowed span into a 32-bit reservoir, four bytes at a
/// time (fewer at the tail of the span). The reader never copies the span.
///
/// Reading past the end sets a sticky over-read flag: the failing call and every
/// later call report [`TsError::Overread`] without consuming anything.
///
/// Example:
/// ```
/// use tsplane::utils::BitReader;
///
/// let data = [0b1011_0011, 0xff];
/// let mut reader = BitReader::new(&data);
///
/// assert_eq!(reader.get_bits(3), 0b101);
/// assert_eq!(reader.get_bits_graceful(5).unwrap(), 0b10011);
/// assert_eq!(reader.num_bits_left(), 8);
/// assert!(reader.get_bits_graceful(9).is_err());
/// assert!(reader.over_read());
/// ```
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Bytes already moved into the reservoir
    offset: usize,
    reservoir: u32,
    bits_left: usize,
    over_read: bool,
}

impl<'a> BitReader<'a> {
    /// Creates a new BitReader over a byte slice
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            offset: 0,
            reservoir: 0,
            bits_left: 0,
            over_read: false,
        }
    }

    fn fill_reservoir(&mut self) {
        let n = (self.data.len() - self.offset).min(4);
        let mut reservoir = 0u32;
        for &byte in &self.data[self.offset..self.offset + n] {
            reservoir = (reservoir << 8) | u32::from(byte);
        }
        self.offset += n;
        self.bits_left = 8 * n;
        self.reservoir = if n == 4 {
            reservoir
        } else {
            reservoir << (32 - 8 * n)
        };
    }

    // Caller guarantees n <= 32 and n <= num_bits_left().
    fn take(&mut self, mut n: usize) -> u32 {
        let mut result = 0u64;
        while n > 0 {
            if self.bits_left == 0 {
                self.fill_reservoir();
            }
            let m = n.min(self.bits_left);
            result = (result << m) | u64::from(self.reservoir >> (32 - m));
            self.reservoir = self.reservoir.checked_shl(m as u32).unwrap_or(0);
            self.bits_left -= m;
            n -= m;
        }
        result as u32
    }

    fn check_available(&mut self, n: usize) -> Result<()> {
        let available = self.num_bits_left();
        if self.over_read {
            return Err(TsError::Overread {
                requested: n,
                available,
            });
        }
        if n > available {
            self.over_read = true;
            return Err(TsError::Overread {
                requested: n,
                available,
            });
        }
        Ok(())
    }

    /// Reads `n` bits (at most 32), most significant bit first.
    ///
    /// # Panics
    ///
    /// Panics if `n > 32` or fewer than `n` bits remain. Use
    /// [`get_bits_graceful`](Self::get_bits_graceful) on untrusted input.
    pub fn get_bits(&mut self, n: usize) -> u32 {
        match self.get_bits_graceful(n) {
            Ok(value) => value,
            Err(e) => panic!("get_bits({}) failed: {}", n, e),
        }
    }

    /// Reads `n` bits (at most 32), failing instead of panicking.
    ///
    /// A request for more bits than remain latches the over-read flag.
    pub fn get_bits_graceful(&mut self, n: usize) -> Result<u32> {
        if n > 32 {
            return Err(TsError::InvalidArgument(format!(
                "cannot read {} bits at once",
                n
            )));
        }
        self.check_available(n)?;
        Ok(self.take(n))
    }

    /// Reads `n` bits, substituting `fallback` when they are not available.
    pub fn get_bits_with_fallback(&mut self, n: usize, fallback: u32) -> u32 {
        self.get_bits_graceful(n).unwrap_or(fallback)
    }

    /// Skips `n` bits; any count is accepted.
    pub fn skip_bits(&mut self, n: usize) -> Result<()> {
        self.check_available(n)?;
        let mut n = n;
        while n > 32 {
            self.take(32);
            n -= 32;
        }
        self.take(n);
        Ok(())
    }

    /// Pushes the `n` most recently read bits back so they are read again.
    ///
    /// Only supported within one reservoir width: `n <= 32`, no more bits than have
    /// been consumed, and the partially consumed byte plus `n` must fit the reservoir.
    pub fn put_bits(&mut self, value: u32, n: usize) -> Result<()> {
        if self.over_read {
            return Err(TsError::Overread {
                requested: n,
                available: 0,
            });
        }
        if n > 32 {
            return Err(TsError::InvalidArgument(format!(
                "cannot push back {} bits at once",
                n
            )));
        }
        if n == 0 {
            return Ok(());
        }
        let consumed = 8 * self.offset - self.bits_left;
        if n > consumed {
            return Err(TsError::InvalidArgument(format!(
                "cannot push back {} bits, only {} consumed",
                n, consumed
            )));
        }
        if self.bits_left % 8 + n > 32 {
            return Err(TsError::InvalidArgument(format!(
                "{} bits do not fit the reservoir",
                n
            )));
        }

        // Whole bytes at the tail of the reservoir go back to the span.
        while self.bits_left + n > 32 {
            self.bits_left -= 8;
            self.offset -= 1;
        }

        let value = if n == 32 { value } else { value & ((1 << n) - 1) };
        self.reservoir = if n == 32 {
            value
        } else {
            (self.reservoir >> n) | (value << (32 - n))
        };
        self.bits_left += n;
        Ok(())
    }

    /// Exact number of unread bits.
    pub fn num_bits_left(&self) -> usize {
        8 * (self.data.len() - self.offset) + self.bits_left
    }

    /// Returns true once a read has run past the end of the span.
    pub fn over_read(&self) -> bool {
        self.over_read
    }

    /// The span from the first byte that is not fully consumed.
    ///
    /// A partially read byte is included.
    pub fn data(&self) -> &'a [u8] {
        &self.data[self.offset - (self.bits_left + 7) / 8..]
    }
}
