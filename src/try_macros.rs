//! Various try macros for common unit conversions

/// Shortened macro for `u64::try_from(val).unwrap()`
#[macro_export]
macro_rules! try_u64 {
    ($val:expr) => {
        u64::try_from($val).unwrap()
    };
}

/// Shortened macro for `usize::try_from(val).unwrap()`
#[macro_export]
macro_rules! try_usize {
    ($val:expr) => {
        usize::try_from($val).unwrap()
    };
}
