//! Cheaply cloneable, immutable strings.
//!
//! Most strings in the server (expectation ids, client ids, header names in
//! matchers) are written once and cloned many times across snapshots, so we
//! use a reference counted string rather than `String`.

use arcstr::ArcStr;
pub use arcstr::{format, literal};

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}
