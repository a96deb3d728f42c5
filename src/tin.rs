//! Structural rules for taxpayer identification numbers and a random
//! generator used to build candidate pools and fixtures.
//!
//! Only the shape of a number is checked; nothing here knows whether a
//! number was ever issued.

use std::fmt;

use rand::Rng;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two-digit EIN prefixes assigned by the IRS campuses.
pub const VALID_EIN_PREFIXES: [u8; 83] = [
    1, 2, 3, 4, 5, 6, 10, 11, 12, 13, 14, 15, 16, 20, 21, 22, 23, 24, 25, 26, 27, 30, 31, 32, 33,
    34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 50, 51, 52, 53, 54, 55, 56, 57, 58,
    59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 71, 72, 73, 74, 75, 76, 77, 80, 81, 82, 83, 84, 85, 86,
    87, 88, 90, 91, 92, 93, 94, 95, 98, 99,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TinKind {
    Ssn,
    Itin,
    Ein,
    /// SSN-formatted but structurally impossible (includes malformed ITINs).
    InvalidSsn,
}

impl fmt::Display for TinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TinKind::Ssn => "ssn",
            TinKind::Itin => "itin",
            TinKind::Ein => "ein",
            TinKind::InvalidSsn => "invalid_ssn",
        };
        f.write_str(label)
    }
}

/// ITINs use area 900-999 with a group in 50-65, 70-88, 90-92, or 94-99.
pub fn is_valid_itin(area: u16, group: u8) -> bool {
    (900..=999).contains(&area)
        && matches!(group, 50..=65 | 70..=88 | 90..=92 | 94..=99)
}

/// A valid SSN has area 001-899 except 666, a non-zero group, and a non-zero serial.
pub fn is_valid_ssn(area: u16, group: u8, serial: u16) -> bool {
    (1..=899).contains(&area) && area != 666 && (1..=99).contains(&group) && (1..=9999).contains(&serial)
}

/// True for SSN-formatted numbers that can be neither an SSN nor an ITIN.
pub fn is_invalid_ssn(area: u16, group: u8, serial: u16) -> bool {
    if area > 999 || group > 99 || serial > 9999 {
        return true;
    }
    if area == 0 || area == 666 || group == 0 || serial == 0 {
        return true;
    }
    area >= 900 && !is_valid_itin(area, group)
}

pub fn is_valid_ein_prefix(prefix: u8) -> bool {
    VALID_EIN_PREFIXES.contains(&prefix)
}

/// Split `AAA-GG-SSSS` into its numeric parts.
pub fn parse_ssn_format(value: &str) -> Option<(u16, u8, u16)> {
    let mut parts = value.split('-');
    let area = parts.next().filter(|p| p.len() == 3)?;
    let group = parts.next().filter(|p| p.len() == 2)?;
    let serial = parts.next().filter(|p| p.len() == 4)?;
    if parts.next().is_some() {
        return None;
    }
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !(digits(area) && digits(group) && digits(serial)) {
        return None;
    }
    Some((area.parse().ok()?, group.parse().ok()?, serial.parse().ok()?))
}

/// Classify a formatted identifier, or `None` if it matches no known shape.
pub fn classify(value: &str) -> Option<TinKind> {
    if let Some((area, group, serial)) = parse_ssn_format(value) {
        if is_valid_itin(area, group) && serial > 0 {
            return Some(TinKind::Itin);
        }
        if is_valid_ssn(area, group, serial) {
            return Some(TinKind::Ssn);
        }
        return Some(TinKind::InvalidSsn);
    }
    let (prefix, rest) = value.split_once('-')?;
    if prefix.len() == 2
        && rest.len() == 7
        && value.bytes().filter(|b| *b != b'-').all(|b| b.is_ascii_digit())
        && is_valid_ein_prefix(prefix.parse().ok()?)
    {
        return Some(TinKind::Ein);
    }
    None
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TinError {
    #[error("generated {produced} unique {kind} values out of {requested} after {attempts} attempts")]
    Exhausted {
        kind: TinKind,
        requested: usize,
        produced: usize,
        attempts: usize,
    },
}

/// Random identifier source.
#[derive(Debug)]
pub struct TinGenerator<R: Rng> {
    rng: R,
}

impl<R: Rng> TinGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn generate(&mut self, kind: TinKind) -> String {
        match kind {
            TinKind::Ssn => self.ssn(),
            TinKind::Itin => self.itin(),
            TinKind::Ein => self.ein(),
            TinKind::InvalidSsn => self.invalid_ssn(),
        }
    }

    pub fn ssn(&mut self) -> String {
        let area = loop {
            let area = self.rng.random_range(1..=899u16);
            if area != 666 {
                break area;
            }
        };
        let group = self.rng.random_range(1..=99u8);
        let serial = self.rng.random_range(1..=9999u16);
        format_ssn(area, group, serial)
    }

    pub fn itin(&mut self) -> String {
        const GROUPS: [(u8, u8); 4] = [(50, 65), (70, 88), (90, 92), (94, 99)];
        let area = self.rng.random_range(900..=999u16);
        let (lo, hi) = GROUPS[self.rng.random_range(0..GROUPS.len())];
        let group = self.rng.random_range(lo..=hi);
        let serial = self.rng.random_range(1..=9999u16);
        format_ssn(area, group, serial)
    }

    pub fn ein(&mut self) -> String {
        let prefix = VALID_EIN_PREFIXES[self.rng.random_range(0..VALID_EIN_PREFIXES.len())];
        let serial = self.rng.random_range(0..=9_999_999u32);
        format!("{prefix:02}-{serial:07}")
    }

    pub fn invalid_ssn(&mut self) -> String {
        match self.rng.random_range(0..5u8) {
            0 => format_ssn(0, self.rng.random_range(0..=99), self.rng.random_range(0..=9999)),
            1 => format_ssn(666, self.rng.random_range(0..=99), self.rng.random_range(0..=9999)),
            2 => format_ssn(self.rng.random_range(1..=999), 0, self.rng.random_range(0..=9999)),
            3 => format_ssn(self.rng.random_range(1..=999), self.rng.random_range(0..=99), 0),
            _ => {
                // 9xx area with a group no ITIN range covers
                const GROUPS: [u8; 9] = [0, 10, 20, 30, 40, 49, 66, 89, 93];
                let group = GROUPS[self.rng.random_range(0..GROUPS.len())];
                format_ssn(self.rng.random_range(900..=999), group, self.rng.random_range(0..=9999))
            }
        }
    }

    /// `count` distinct identifiers of `kind`, giving up after `max_attempts` draws.
    pub fn unique_batch(
        &mut self,
        kind: TinKind,
        count: usize,
        max_attempts: usize,
    ) -> Result<Vec<String>, TinError> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::with_capacity(count);
        let mut attempts = 0;
        while out.len() < count {
            if attempts >= max_attempts {
                return Err(TinError::Exhausted {
                    kind,
                    requested: count,
                    produced: out.len(),
                    attempts,
                });
            }
            attempts += 1;
            let value = self.generate(kind);
            if seen.insert(value.clone()) {
                out.push(value);
            }
        }
        Ok(out)
    }
}

fn format_ssn(area: u16, group: u8, serial: u16) -> String {
    format!("{area:03}-{group:02}-{serial:04}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn generator() -> TinGenerator<StdRng> {
        TinGenerator::new(StdRng::seed_from_u64(42))
    }

    #[test]
    fn itin_group_ranges() {
        assert!(is_valid_itin(900, 50));
        assert!(is_valid_itin(999, 99));
        assert!(is_valid_itin(912, 92));
        assert!(!is_valid_itin(912, 93));
        assert!(!is_valid_itin(912, 66));
        assert!(!is_valid_itin(899, 70));
    }

    #[test]
    fn invalid_ssn_rules() {
        assert!(is_invalid_ssn(0, 12, 1234));
        assert!(is_invalid_ssn(666, 12, 1234));
        assert!(is_invalid_ssn(123, 0, 1234));
        assert!(is_invalid_ssn(123, 45, 0));
        assert!(is_invalid_ssn(950, 10, 1234));
        assert!(!is_invalid_ssn(950, 70, 1234));
        assert!(!is_invalid_ssn(123, 45, 6789));
    }

    #[test]
    fn ein_prefixes() {
        assert!(is_valid_ein_prefix(1));
        assert!(is_valid_ein_prefix(98));
        assert!(!is_valid_ein_prefix(7));
        assert!(!is_valid_ein_prefix(69));
        assert!(!is_valid_ein_prefix(96));
    }

    #[test]
    fn generated_values_classify_as_their_kind() {
        let mut tins = generator();
        for kind in [TinKind::Ssn, TinKind::Itin, TinKind::Ein, TinKind::InvalidSsn] {
            for _ in 0..500 {
                let value = tins.generate(kind);
                assert_eq!(classify(&value), Some(kind), "{value}");
            }
        }
    }

    #[test]
    fn parse_rejects_malformed_values() {
        assert_eq!(parse_ssn_format("123-45-6789"), Some((123, 45, 6789)));
        assert_eq!(parse_ssn_format("123456789"), None);
        assert_eq!(parse_ssn_format("12-345-6789"), None);
        assert_eq!(parse_ssn_format("123-45-678a"), None);
        assert_eq!(parse_ssn_format("123-45-6789-0"), None);
        assert_eq!(classify("hello"), None);
    }

    #[test]
    fn unique_batch_is_distinct() {
        let batch = generator().unique_batch(TinKind::Ssn, 1_000, 10_000).unwrap();
        let distinct: FxHashSet<&String> = batch.iter().collect();
        assert_eq!(distinct.len(), 1_000);
    }

    #[test]
    fn unique_batch_fails_instead_of_looping() {
        let err = generator().unique_batch(TinKind::Ein, 50, 10).unwrap_err();
        assert_eq!(
            err,
            TinError::Exhausted {
                kind: TinKind::Ein,
                requested: 50,
                produced: 10,
                attempts: 10,
            }
        );
    }
}
