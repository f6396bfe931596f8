//! Rolling checksum used to find content-defined chunk boundaries
//!
//! The sum is an rsync/Adler-style pair `(s1, s2)` over a 64-byte sliding
//! window. Each byte is offset by a constant so runs of zero bytes still
//! move the sum. A boundary is declared when the low `blob_bits` bits of
//! `s2` are all ones; the number of further consecutive one bits decides
//! how strong the boundary is.

/// log2 of the window size
pub const WINDOW_BITS: u32 = 6;
/// Sliding window length in bytes
pub const WINDOW_SIZE: usize = 1 << WINDOW_BITS;
const CHAR_OFFSET: u32 = 31;

/// Rolling checksum over a fixed window
#[derive(Clone)]
pub struct Rollsum {
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE],
    wofs: usize,
}

impl Default for Rollsum {
    fn default() -> Self {
        Self::new()
    }
}

impl Rollsum {
    /// Fresh state, equivalent to a window full of zero bytes
    pub fn new() -> Self {
        let w = WINDOW_SIZE as u32;
        Self {
            s1: w * CHAR_OFFSET,
            s2: w * (w - 1) * CHAR_OFFSET,
            window: [0u8; WINDOW_SIZE],
            wofs: 0,
        }
    }

    #[inline]
    fn add(&mut self, drop: u8, add: u8) {
        let w = WINDOW_SIZE as u32;
        self.s1 = self.s1.wrapping_add(add as u32).wrapping_sub(drop as u32);
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub(w.wrapping_mul(drop as u32 + CHAR_OFFSET));
    }

    /// Push one byte into the window, evicting the oldest
    #[inline]
    pub fn roll(&mut self, ch: u8) {
        let drop = self.window[self.wofs];
        self.add(drop, ch);
        self.window[self.wofs] = ch;
        self.wofs = (self.wofs + 1) % WINDOW_SIZE;
    }

    /// Current 32-bit digest
    #[inline]
    pub fn digest(&self) -> u32 {
        (self.s1 << 16) | (self.s2 & 0xffff)
    }

    /// Whether the low `blob_bits` bits of the sum are all set
    #[inline]
    pub fn at_boundary(&self, blob_bits: u32) -> bool {
        let mask = (1u32 << blob_bits) - 1;
        self.s2 & mask == mask
    }
}

/// Digest of `data` rolled into a fresh state
pub fn sum(data: &[u8]) -> u32 {
    let mut r = Rollsum::new();
    for &b in data {
        r.roll(b);
    }
    r.digest()
}

/// Find the first boundary in `buf`, starting from a fresh rolling state.
///
/// Returns the offset just past the boundary byte together with the number
/// of matched bits (always `>= blob_bits`).
pub fn find_ofs(buf: &[u8], blob_bits: u32) -> Option<(usize, u32)> {
    let mut r = Rollsum::new();
    for (count, &b) in buf.iter().enumerate() {
        r.roll(b);
        if r.at_boundary(blob_bits) {
            let mut rsum = r.digest() >> blob_bits;
            let mut bits = blob_bits;
            loop {
                rsum >>= 1;
                if rsum & 1 == 0 {
                    break;
                }
                bits += 1;
            }
            return Some((count + 1, bits));
        }
    }
    None
}
