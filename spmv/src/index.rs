//! Index types accepted by the matrix constructors. Callers keep their
//! native integer width; validation narrows to the device representation.

/// Integer types usable as row offsets and column indices.
pub trait ColIndex: Copy + Send + Sync + 'static {
    /// The value as an index, `None` when negative or too wide for the
    /// platform.
    fn as_index(self) -> Option<usize>;
}

macro_rules! col_index_impls {
    ($($t:ty),*) => {$(
        impl ColIndex for $t {
            fn as_index(self) -> Option<usize> {
                usize::try_from(self).ok()
            }
        }
    )*};
}

col_index_impls!(u16, u32, u64, usize, i32, i64, isize);

/// Signed integer types usable as clustered column offsets.
pub trait PatternOffset: Copy + Send + Sync + 'static {
    fn as_offset(self) -> i64;
}

impl PatternOffset for i32 {
    fn as_offset(self) -> i64 {
        self as i64
    }
}

impl PatternOffset for i64 {
    fn as_offset(self) -> i64 {
        self
    }
}

impl PatternOffset for isize {
    fn as_offset(self) -> i64 {
        self as i64
    }
}
