use parking_lot::Mutex;

/// A fixed-capacity circular byte buffer for producer/consumer handoff.
///
/// Capacity is rounded up to a power of two so positions wrap with a mask. Cursors
/// only grow; `write - read` is the occupied length and never exceeds the capacity.
/// Every operation runs under one mutex, which makes the buffer safe for any mix of
/// producer and consumer threads. `put` and `get` never block: a full buffer
/// truncates the write and an empty one returns 0.
///
/// Example:
/// ```
/// use tsplane::utils::RingBuffer;
///
/// let ring = RingBuffer::new(1000);
/// assert_eq!(ring.capacity(), 1024);
///
/// assert_eq!(ring.put(&[1, 2, 3]), 3);
/// let mut out = [0u8; 8];
/// assert_eq!(ring.get(&mut out), 3);
/// assert_eq!(&out[..3], &[1, 2, 3]);
/// ```
pub struct RingBuffer {
    inner: Mutex<RingState>,
    mask: usize,
}

struct RingState {
    storage: Box<[u8]>,
    write: usize,
    read: usize,
}

impl RingState {
    fn occupied(&self) -> usize {
        self.write.wrapping_sub(self.read)
    }

    // Copies out of the buffer starting at the read cursor without moving it.
    fn copy_out(&self, mask: usize, dest: &mut [u8]) -> usize {
        let len = dest.len().min(self.occupied());
        let start = self.read & mask;
        let first = len.min(self.storage.len() - start);
        dest[..first].copy_from_slice(&self.storage[start..start + first]);
        dest[first..len].copy_from_slice(&self.storage[..len - first]);
        len
    }
}

impl RingBuffer {
    /// Allocates a zeroed buffer of `requested_size` rounded up to a power of two.
    ///
    /// Allocation failure aborts the process, like any Rust allocation.
    pub fn new(requested_size: usize) -> Self {
        let capacity = requested_size.max(1).next_power_of_two();
        Self {
            inner: Mutex::new(RingState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                write: 0,
                read: 0,
            }),
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Copies as much of `data` as fits and returns the number of bytes written.
    ///
    /// A short count means the rest was not stored; unread data is never overwritten.
    pub fn put(&self, data: &[u8]) -> usize {
        let mut state = self.inner.lock();
        let free = self.capacity() - state.occupied();
        let len = data.len().min(free);

        let start = state.write & self.mask;
        let first = len.min(self.capacity() - start);
        state.storage[start..start + first].copy_from_slice(&data[..first]);
        state.storage[..len - first].copy_from_slice(&data[first..len]);

        state.write = state.write.wrapping_add(len);
        len
    }

    /// Moves up to `dest.len()` bytes out and returns how many were read.
    pub fn get(&self, dest: &mut [u8]) -> usize {
        let mut state = self.inner.lock();
        let len = state.copy_out(self.mask, dest);
        state.read = state.read.wrapping_add(len);
        len
    }

    /// Copies up to `dest.len()` bytes out without consuming them.
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        self.inner.lock().copy_out(self.mask, dest)
    }

    /// Discards up to `len` unread bytes and returns how many were dropped.
    pub fn skip(&self, len: usize) -> usize {
        let mut state = self.inner.lock();
        let len = len.min(state.occupied());
        state.read = state.read.wrapping_add(len);
        len
    }

    /// Occupied bytes at the moment of the call.
    pub fn len(&self) -> usize {
        self.inner.lock().occupied()
    }

    /// Free bytes at the moment of the call.
    ///
    /// Only a snapshot: another thread may change it before the caller acts on it.
    pub fn space(&self) -> usize {
        self.capacity() - self.inner.lock().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all content. Producers and consumers must be quiesced first.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.write = 0;
        state.read = 0;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("write", &state.write)
            .field("read", &state.read)
            .finish()
    }
}
