/// A fixed-size, totally ordered key.
///
/// The engine operates on keys purely through this trait: `Ord` supplies the
/// strict less-than, `Clone` the copy, `Drop` the destruction, and the byte
/// codec the on-disk form. Every key of a given type encodes to exactly
/// [`Key::LEN`] bytes; on disk each entry is padded to 4 byte alignment.
pub trait Key: Clone + Ord + std::fmt::Debug {
    /// Encoded byte length.
    const LEN: usize;

    /// Writes exactly [`Self::LEN`] bytes into `buf`.
    fn write_bytes(&self, buf: &mut [u8]);

    /// Reads a key back from exactly [`Self::LEN`] bytes.
    fn read_bytes(buf: &[u8]) -> Self;

    /// Estimate of heap memory owned by this key, beyond its encoded size.
    fn mem_estimate(&self) -> usize {
        0
    }
}

/// Per-entry on-disk size of `K`, rounded up to 4 byte alignment.
#[inline]
pub(crate) const fn aligned_len<K: Key>() -> usize {
    (K::LEN + 3) & !3
}

macro_rules! int_key {
    ($($t:ty),*) => {$(
        impl Key for $t {
            const LEN: usize = std::mem::size_of::<$t>();

            #[inline]
            fn write_bytes(&self, buf: &mut [u8]) {
                buf[..Self::LEN].copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_bytes(buf: &[u8]) -> Self {
                Self::from_le_bytes(buf[..Self::LEN].try_into().unwrap())
            }
        }
    )*}
}

int_key!(u32, u64, i32, i64);

impl<const N: usize> Key for [u8; N] {
    const LEN: usize = N;

    #[inline]
    fn write_bytes(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(self);
    }

    #[inline]
    fn read_bytes(buf: &[u8]) -> Self {
        buf[..N].try_into().unwrap()
    }
}
