//! Supporting utility types.
mod bytestr;

pub use bytestr::ByteStr;

/// Wire-level trace, compiled in with the `verbose` feature.
macro_rules! verbose {
    ($($tt:tt)*) => {
        #[cfg(feature = "verbose")]
        tracing::trace!($($tt)*)
    };
}

pub(crate) use verbose;
