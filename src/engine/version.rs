//! Driver Version Comparator
//!
//! Parses vendor driver version strings and orders them totally:
//! numeric components first, then release date, then vendor suffix.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::error::{EngineError, Result};

/// major.minor.build.revision
pub const MAX_COMPONENTS: usize = 4;

/// A structured driver version identifier.
///
/// Missing trailing components compare as zero, so `1.2` and `1.2.0.0`
/// are equal. Equality and hashing follow [`compare`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "VersionRepr", into = "VersionRepr")]
pub struct DriverVersion {
    components: Vec<u32>,
    suffix: Option<String>,
    release_date: Option<NaiveDate>,
}

/// Order two driver versions.
pub fn compare(a: &DriverVersion, b: &DriverVersion) -> Ordering {
    for i in 0..MAX_COMPONENTS {
        match a.component(i).cmp(&b.component(i)) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    // None sorts before Some, so a dated release outranks an undated one.
    match a.release_date.cmp(&b.release_date) {
        Ordering::Equal => {}
        ord => return ord,
    }
    a.suffix.cmp(&b.suffix)
}

impl DriverVersion {
    /// Parse a version string such as `31.0.15.3623`, `v2.1`, or `1.4.0-whql`.
    pub fn parse(text: &str) -> Result<Self> {
        let unparseable = || EngineError::UnparseableVersion(text.to_string());

        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix(|c: char| c == 'v' || c == 'V')
            .unwrap_or(trimmed);

        let numeric_end = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (numeric, rest) = body.split_at(numeric_end);
        if numeric.is_empty() {
            return Err(unparseable());
        }

        let mut components = Vec::with_capacity(MAX_COMPONENTS);
        for part in numeric.split('.') {
            if part.is_empty() {
                return Err(unparseable());
            }
            let value: u32 = part.parse().map_err(|_| unparseable())?;
            components.push(value);
        }
        if components.len() > MAX_COMPONENTS {
            return Err(unparseable());
        }

        let suffix = if rest.is_empty() {
            None
        } else {
            let stripped = rest
                .strip_prefix(|c: char| matches!(c, '-' | '+' | '_' | ' '))
                .unwrap_or(rest)
                .trim();
            if stripped.is_empty() {
                return Err(unparseable());
            }
            Some(stripped.to_string())
        };

        Ok(Self {
            components,
            suffix,
            release_date: None,
        })
    }

    /// Parse an INF `DriverVer` value: `MM/DD/YYYY,1.2.3.4`.
    ///
    /// pnputil prints the same pair separated by a space; both forms are accepted.
    pub fn parse_driver_ver(text: &str) -> Result<Self> {
        let unparseable = || EngineError::UnparseableVersion(text.to_string());
        let (date, version) = text
            .trim()
            .split_once(|c: char| c == ',' || c.is_whitespace())
            .ok_or_else(unparseable)?;
        let date = NaiveDate::parse_from_str(date.trim(), "%m/%d/%Y").map_err(|_| unparseable())?;
        Ok(Self::parse(version)?.with_release_date(date))
    }

    pub fn with_release_date(mut self, date: NaiveDate) -> Self {
        self.release_date = Some(date);
        self
    }

    pub fn component(&self, index: usize) -> u32 {
        self.components.get(index).copied().unwrap_or(0)
    }

    pub fn components(&self) -> &[u32] {
        &self.components
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    pub fn release_date(&self) -> Option<NaiveDate> {
        self.release_date
    }

    pub fn is_newer_than(&self, other: &DriverVersion) -> bool {
        compare(self, other) == Ordering::Greater
    }

    /// Whether a version read back from the host denotes this release.
    ///
    /// Hosts frequently report a version without its date, so dates only
    /// count when both sides carry one.
    pub fn same_release(&self, other: &DriverVersion) -> bool {
        let numbers_match = (0..MAX_COMPONENTS).all(|i| self.component(i) == other.component(i));
        let dates_match = match (self.release_date, other.release_date) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        numbers_match && dates_match && self.suffix == other.suffix
    }
}

impl fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let numbers = self
            .components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");
        match &self.suffix {
            Some(suffix) => write!(f, "{}-{}", numbers, suffix),
            None => write!(f, "{}", numbers),
        }
    }
}

impl std::str::FromStr for DriverVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialEq for DriverVersion {
    fn eq(&self, other: &Self) -> bool {
        compare(self, other) == Ordering::Equal
    }
}

impl Eq for DriverVersion {}

impl PartialOrd for DriverVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DriverVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl Hash for DriverVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for i in 0..MAX_COMPONENTS {
            self.component(i).hash(state);
        }
        self.release_date.hash(state);
        self.suffix.hash(state);
    }
}

/// Wire form: a bare string, or `{ "version": ..., "date": ... }` when dated.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum VersionRepr {
    Text(String),
    Dated {
        version: String,
        #[serde(default)]
        date: Option<NaiveDate>,
    },
}

impl TryFrom<VersionRepr> for DriverVersion {
    type Error = EngineError;

    fn try_from(repr: VersionRepr) -> Result<Self> {
        match repr {
            VersionRepr::Text(text) => Self::parse(&text),
            VersionRepr::Dated { version, date } => {
                let parsed = Self::parse(&version)?;
                Ok(match date {
                    Some(date) => parsed.with_release_date(date),
                    None => parsed,
                })
            }
        }
    }
}

impl From<DriverVersion> for VersionRepr {
    fn from(version: DriverVersion) -> Self {
        match version.release_date {
            Some(date) => VersionRepr::Dated {
                version: version.to_string(),
                date: Some(date),
            },
            None => VersionRepr::Text(version.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> DriverVersion {
        DriverVersion::parse(s).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_component_ordering() {
        assert_eq!(compare(&v("1.2.0"), &v("1.0.0")), Ordering::Greater);
        assert_eq!(compare(&v("1.9.0"), &v("2.0.0")), Ordering::Less);
        assert_eq!(compare(&v("31.0.15.3623"), &v("31.0.15.3598")), Ordering::Greater);
        assert_eq!(compare(&v("1.10"), &v("1.9")), Ordering::Greater);
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(compare(&v("1.2"), &v("1.2.0.0")), Ordering::Equal);
        assert_eq!(v("1.2"), v("1.2.0"));
        assert_eq!(compare(&v("1.2"), &v("1.2.0.1")), Ordering::Less);
    }

    #[test]
    fn test_date_breaks_ties() {
        let older = v("5.1").with_release_date(date(2023, 1, 10));
        let newer = v("5.1").with_release_date(date(2024, 3, 2));
        assert_eq!(compare(&newer, &older), Ordering::Greater);
        assert_eq!(compare(&older, &v("5.1")), Ordering::Greater);
        // Numbers still dominate dates.
        assert_eq!(compare(&v("5.2"), &newer), Ordering::Greater);
    }

    #[test]
    fn test_suffix_breaks_remaining_ties() {
        assert_eq!(compare(&v("2.0-b"), &v("2.0-a")), Ordering::Greater);
        assert_eq!(compare(&v("2.0"), &v("2.0-a")), Ordering::Less);
    }

    #[test]
    fn test_parse_accepts_vendor_forms() {
        assert_eq!(v("v2.1").components(), &[2, 1]);
        assert_eq!(v("1.4.0-whql").suffix(), Some("whql"));
        assert_eq!(v("10.18.14.6089 beta").suffix(), Some("beta"));
        assert_eq!(v("6.0.9088+build7").suffix(), Some("build7"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "abc", "1..2", "1.", ".1", "1.2.3.4.5", "99999999999", "1.2-", "v"] {
            let err = DriverVersion::parse(bad).unwrap_err();
            assert!(
                matches!(err, EngineError::UnparseableVersion(_)),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_parse_driver_ver() {
        let version = DriverVersion::parse_driver_ver("06/21/2023,31.0.15.3623").unwrap();
        assert_eq!(version.to_string(), "31.0.15.3623");
        assert_eq!(version.release_date(), Some(date(2023, 6, 21)));

        let spaced = DriverVersion::parse_driver_ver("06/21/2023 31.0.15.3623").unwrap();
        assert_eq!(spaced, version);

        assert!(DriverVersion::parse_driver_ver("31.0.15.3623").is_err());
    }

    #[test]
    fn test_same_release_ignores_missing_date() {
        let dated = v("1.2.0").with_release_date(date(2024, 1, 1));
        assert!(dated.same_release(&v("1.2")));
        assert!(!dated.same_release(&v("1.0.0")));
        assert!(!dated.same_release(&v("1.2.0").with_release_date(date(2023, 1, 1))));
    }

    #[test]
    fn test_serde_forms() {
        let plain: DriverVersion = serde_json::from_str("\"1.2.0\"").unwrap();
        assert_eq!(plain, v("1.2.0"));
        assert_eq!(serde_json::to_string(&plain).unwrap(), "\"1.2.0\"");

        let dated: DriverVersion =
            serde_json::from_str(r#"{"version": "1.2.0", "date": "2024-05-01"}"#).unwrap();
        assert_eq!(dated.release_date(), Some(date(2024, 5, 1)));
        let back: DriverVersion = serde_json::from_str(&serde_json::to_string(&dated).unwrap()).unwrap();
        assert_eq!(back, dated);

        assert!(serde_json::from_str::<DriverVersion>("\"not-a-version\"").is_err());
    }

    fn arb_version() -> impl Strategy<Value = DriverVersion> {
        (
            prop::collection::vec(0u32..20, 1..=MAX_COMPONENTS),
            prop::option::of("[a-z][a-z0-9]{0,5}"),
            prop::option::of(0i64..2000),
        )
            .prop_map(|(components, suffix, days)| DriverVersion {
                components,
                suffix,
                release_date: days.map(|d| date(2020, 1, 1) + chrono::Duration::days(d)),
            })
    }

    proptest! {
        #[test]
        fn prop_compare_is_antisymmetric(a in arb_version(), b in arb_version()) {
            prop_assert_eq!(compare(&a, &b), compare(&b, &a).reverse());
        }

        #[test]
        fn prop_compare_is_transitive(a in arb_version(), b in arb_version(), c in arb_version()) {
            let mut sorted = vec![a, b, c];
            sorted.sort_by(compare);
            prop_assert_ne!(compare(&sorted[0], &sorted[1]), Ordering::Greater);
            prop_assert_ne!(compare(&sorted[1], &sorted[2]), Ordering::Greater);
            prop_assert_ne!(compare(&sorted[0], &sorted[2]), Ordering::Greater);
        }

        #[test]
        fn prop_equal_means_equal_hash(a in arb_version(), b in arb_version()) {
            use std::collections::hash_map::DefaultHasher;
            if compare(&a, &b) == Ordering::Equal {
                let mut ha = DefaultHasher::new();
                let mut hb = DefaultHasher::new();
                a.hash(&mut ha);
                b.hash(&mut hb);
                prop_assert_eq!(ha.finish(), hb.finish());
            }
        }

        #[test]
        fn prop_canonical_string_round_trips(
            components in prop::collection::vec(0u32..100_000, 1..=MAX_COMPONENTS),
            suffix in prop::option::of("[a-z][a-z0-9.]{0,8}"),
        ) {
            let mut canonical = components.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(".");
            if let Some(s) = &suffix {
                canonical.push('-');
                canonical.push_str(s);
            }
            let parsed = DriverVersion::parse(&canonical).unwrap();
            prop_assert_eq!(parsed.to_string(), canonical);
        }
    }
}
