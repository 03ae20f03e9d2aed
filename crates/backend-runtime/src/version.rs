//! Dotted version parsing and comparison
//!
//! Tolerates tags with prefixes and build metadata (`v1.2.3`,
//! `32.0.203.311`, `0.9.10-rc1`) by keeping only the leading digits of each
//! dot-separated segment.

use std::fmt;

/// A parsed version: the numeric prefix of every dot-separated segment.
///
/// An empty version (nothing parsed) never satisfies or equals anything,
/// including another empty version, so a malformed config string can never
/// look like a met requirement.
#[derive(Debug, Clone, Default)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let working = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if working.is_empty() {
            return Self::default();
        }

        // Segments without a leading digit are skipped; overflow counts as 0
        let parts = working
            .split('.')
            .filter_map(|segment| {
                let digits: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    None
                } else {
                    Some(digits.parse::<u64>().unwrap_or(0))
                }
            })
            .collect();

        Self { parts }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    /// `self >= other`, false when either side is empty
    pub fn satisfies(&self, other: &Version) -> bool {
        match self.compare(other) {
            Some(ordering) => ordering != std::cmp::Ordering::Less,
            None => false,
        }
    }

    /// Zero-padded element-wise comparison; `None` when either side is empty
    pub fn compare(&self, other: &Version) -> Option<std::cmp::Ordering> {
        if self.is_empty() || other.is_empty() {
            return None;
        }

        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                std::cmp::Ordering::Equal => continue,
                ordering => return Some(ordering),
            }
        }
        Some(std::cmp::Ordering::Equal)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(std::cmp::Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.compare(other)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", rendered.join("."))
    }
}

/// `required <= installed` on raw strings
pub fn is_at_least(installed: &str, required: &str) -> bool {
    Version::parse(installed).satisfies(&Version::parse(required))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflexive() {
        for v in ["1", "1.2", "1.2.3", "v0.9.10", "32.0.203.311"] {
            let parsed = Version::parse(v);
            assert!(parsed.satisfies(&parsed), "{v} >= {v}");
            assert_eq!(parsed, parsed.clone());
        }
    }

    #[test]
    fn test_zero_padding() {
        assert_eq!(Version::parse("1.2"), Version::parse("1.2.0"));
        assert_eq!(Version::parse("1.2.0.0"), Version::parse("1.2"));
        assert_ne!(Version::parse("1.2"), Version::parse("1.2.1"));
    }

    #[test]
    fn test_prefix_and_ordering() {
        assert!(Version::parse("v2.0").satisfies(&Version::parse("1.9.9")));
        assert!(!Version::parse("1.9.9").satisfies(&Version::parse("V2.0")));
        assert!(Version::parse("0.10.0") > Version::parse("0.9.12"));
    }

    #[test]
    fn test_build_metadata_is_tolerated() {
        assert_eq!(Version::parse("32.0.203.311").parts(), &[32, 0, 203, 311]);
        assert_eq!(Version::parse("1.2rc3.4").parts(), &[1, 2, 4]);
        assert_eq!(Version::parse("0.9.x.1").parts(), &[0, 9, 1]);
        // Tags without a numeric prefix do not parse at all
        assert!(Version::parse("master-017-abc1234").is_empty());
        assert!(Version::parse("b6510").is_empty());
    }

    #[test]
    fn test_empty_never_satisfies() {
        let empty = Version::parse("");
        assert!(empty.is_empty());
        assert!(!empty.satisfies(&Version::parse("1.0")));
        assert!(!Version::parse("1.0").satisfies(&empty));
        assert!(!empty.satisfies(&empty));
        assert_ne!(empty, Version::parse(""));
        assert!(!is_at_least("", "0.0.1"));
        assert!(!is_at_least("v", "0"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Version::parse("v1.2.3-beta").to_string(), "1.2.3");
    }
}
