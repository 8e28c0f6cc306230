use arcstr::ArcStr;

/// Strng is a cheaply clonable, immutable string. It is used for identity-like
/// values (route names, policy names, rate limit keys) that are cloned on every
/// request.
pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub const EMPTY: Strng = arcstr::literal!("");

pub use arcstr::format;
pub use arcstr::literal;
