//! Extra column and parameter codecs.
#[cfg(feature = "json")]
mod json;

#[cfg(feature = "json")]
pub use json::Json;
