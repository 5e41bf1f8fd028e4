//! PE structure definitions and read-only decoders (spec.md §4.1 "PeView").

pub mod headers;
pub mod view;

pub use headers::*;
pub use view::*;
