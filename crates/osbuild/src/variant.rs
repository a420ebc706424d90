use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

/// Tokens accepted by [`resolve`], in the order they are listed in errors.
pub const ACCEPTED: [&str; 2] = ["debug", "optimized"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuildVariant {
    Debug,
    Optimized,
}

impl BuildVariant {
    pub const ALL: [BuildVariant; 2] = [BuildVariant::Debug, BuildVariant::Optimized];

    /// Directory tag. Matches cargo's profile directory so artifact paths and image
    /// output paths share one namespace per variant.
    pub fn tag(self) -> &'static str {
        match self {
            BuildVariant::Debug => "debug",
            BuildVariant::Optimized => "release",
        }
    }

    pub fn cargo_flags(self) -> &'static [&'static str] {
        match self {
            BuildVariant::Debug => &[],
            BuildVariant::Optimized => &["--release"],
        }
    }

    pub fn selector(self) -> &'static str {
        match self {
            BuildVariant::Debug => ACCEPTED[0],
            BuildVariant::Optimized => ACCEPTED[1],
        }
    }
}

impl fmt::Display for BuildVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.selector())
    }
}

impl FromStr for BuildVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        resolve(s)
    }
}

pub fn resolve(selector: &str) -> Result<BuildVariant> {
    let token = selector.trim();
    if token.eq_ignore_ascii_case(ACCEPTED[0]) {
        return Ok(BuildVariant::Debug);
    }
    if token.eq_ignore_ascii_case(ACCEPTED[1]) {
        return Ok(BuildVariant::Optimized);
    }
    Err(Error::new(
        ErrorKind::InvalidVariant,
        format!(
            "unknown build variant '{}' (accepted: {})",
            selector,
            ACCEPTED.join(", ")
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_case_insensitively() {
        assert_eq!(resolve("debug").unwrap(), BuildVariant::Debug);
        assert_eq!(resolve("Optimized").unwrap(), BuildVariant::Optimized);
        assert_eq!(resolve(" DEBUG ").unwrap(), BuildVariant::Debug);
    }

    #[test]
    fn rejects_unknown_token_listing_accepted_values() {
        let err = resolve("Staging").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidVariant);
        let msg = err.to_string();
        assert!(msg.contains("Staging"), "unexpected err: {msg}");
        assert!(msg.contains("debug, optimized"), "unexpected err: {msg}");
    }

    #[test]
    fn release_is_a_tag_not_a_selector() {
        assert!(resolve("release").is_err());
        assert_eq!(BuildVariant::Optimized.tag(), "release");
    }

    #[test]
    fn variants_have_distinct_tags() {
        assert_ne!(BuildVariant::Debug.tag(), BuildVariant::Optimized.tag());
        assert!(BuildVariant::Debug.cargo_flags().is_empty());
        assert_eq!(BuildVariant::Optimized.cargo_flags(), &["--release"]);
    }
}
