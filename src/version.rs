//! Dotted version strings: parsing and ordering.
//!
//! Versions in recipe names and minimum-toolchain tables are loose:
//! `11.3.0`, `2022a`, `system`. Components are split on `.`; numeric
//! components compare numerically, anything else sorts below a number at
//! the same position. Missing trailing components count as zero.

use std::cmp::Ordering;
use std::fmt;

/// One dot-separated component of a version.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Number(u64),
    Text(String),
}

impl Ord for Part {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.cmp(b),
            (Self::Text(_), Self::Number(_)) => Ordering::Less,
            (Self::Number(_), Self::Text(_)) => Ordering::Greater,
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Part {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const ZERO: Part = Part::Number(0);

/// A parsed version string that keeps its original text for display.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    parts: Vec<Part>,
}

impl Version {
    /// Parse any version string. Never fails: unparseable components become text.
    pub fn parse(raw: &str) -> Self {
        let parts = raw
            .split('.')
            .map(|p| match p.parse::<u64>() {
                Ok(n) => Part::Number(n),
                Err(_) => Part::Text(p.to_string()),
            })
            .collect();
        Self {
            raw: raw.to_string(),
            parts,
        }
    }

    /// Parse a version only if every component is numeric.
    pub fn strict(raw: &str) -> Option<Self> {
        let version = Self::parse(raw);
        version
            .parts
            .iter()
            .all(|p| matches!(p, Part::Number(_)))
            .then_some(version)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).unwrap_or(&ZERO);
            let b = other.parts.get(i).unwrap_or(&ZERO);
            match a.cmp(b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s)
    }

    #[test]
    fn numeric_components_compare_numerically() {
        assert!(v("10.3") < v("11.0"));
        assert!(v("11.10") > v("11.9"));
        assert!(v("1.2.3") < v("1.2.10"));
    }

    #[test]
    fn trailing_zeros_are_insignificant() {
        assert_eq!(v("11"), v("11.0"));
        assert_eq!(v("12.0.0"), v("12"));
        assert!(v("11") < v("11.0.1"));
    }

    #[test]
    fn text_component_sorts_below_number() {
        assert!(v("system") < v("0"));
        assert!(v("1.x") < v("1.0"));
    }

    #[test]
    fn text_components_compare_lexically() {
        assert!(v("2021b") < v("2022a"));
        assert!(v("2022a") < v("2022b"));
        assert_eq!(v("2022a"), v("2022a"));
    }

    #[test]
    fn strict_rejects_text() {
        assert!(Version::strict("1.0.2").is_some());
        assert!(Version::strict("foss-2022a").is_none());
        assert!(Version::strict("2022a").is_none());
    }

    #[test]
    fn display_keeps_original_text() {
        assert_eq!(v("11.3.0").to_string(), "11.3.0");
        assert_eq!(v("2022a").to_string(), "2022a");
    }
}
