//! Structural cross-check of a reassembled status response against byte patterns captured
//! from known-good exchanges.
//!
//! Nothing here gates parsing. A report that fails is logged and the parser runs anyway;
//! the checks exist to notice firmware changes and transport corruption.

use std::fmt;
use std::ops::RangeInclusive;

pub const EXPECTED_PREFIX: [u8; 4] = [0x32, 0x12, 0x12, 0x10];
pub const EXPECTED_SUFFIX: [u8; 18] = [
    0x3a, 0x02, 0x08, 0x02, 0x52, 0x0c, 0x0a, 0x0a, 0x0a, 0x02, 0x40, 0x03, 0x10, 0x01, 0x18, 0x02, 0x20, 0x01,
];
pub const MIN_RESPONSE_LEN: usize = 35;
pub const MAX_RESPONSE_LEN: usize = 100;

const ROUTING_ADDRESS_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    TooShort { len: usize },
    TooLong { len: usize },
    Prefix { actual: Vec<u8> },
    Suffix { actual: Vec<u8> },
    /// Too short to hold the pattern at all.
    Missing { pattern: &'static str },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::TooShort { len } => write!(f, "response too short: {len} bytes (min: {MIN_RESPONSE_LEN})"),
            Mismatch::TooLong { len } => write!(f, "response too long: {len} bytes (max: {MAX_RESPONSE_LEN})"),
            Mismatch::Prefix { actual } => write!(
                f,
                "prefix mismatch: expected {}, got {}",
                hex::encode(EXPECTED_PREFIX),
                hex::encode(actual)
            ),
            Mismatch::Suffix { actual } => write!(
                f,
                "suffix mismatch: expected {}, got {}",
                hex::encode(EXPECTED_SUFFIX),
                hex::encode(actual)
            ),
            Mismatch::Missing { pattern } => write!(f, "response too short to check {pattern}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub length_valid: bool,
    pub prefix_match: bool,
    pub suffix_match: bool,
    /// The routing address the vehicle echoed back, bytes `[4, 20)`.
    pub routing_address: Option<[u8; 16]>,
    pub mismatches: Vec<Mismatch>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |b: bool| if b { "YES" } else { "NO" };
        writeln!(f, "Validation Result: {}", if self.is_valid() { "PASS" } else { "FAIL" })?;
        writeln!(f, "  Prefix Match: {}", yes_no(self.prefix_match))?;
        writeln!(f, "  Suffix Match: {}", yes_no(self.suffix_match))?;
        write!(f, "  Length Valid: {}", yes_no(self.length_valid))?;
        if let Some(address) = &self.routing_address {
            write!(f, "\n  Routing Address: {}", hex::encode(address))?;
        }
        for mismatch in &self.mismatches {
            write!(f, "\n  - {mismatch}")?;
        }
        Ok(())
    }
}

pub fn validate_response(response: &[u8]) -> ValidationReport {
    let len = response.len();
    let mut mismatches = Vec::new();

    let length_valid = (MIN_RESPONSE_LEN..=MAX_RESPONSE_LEN).contains(&len);
    if len < MIN_RESPONSE_LEN {
        mismatches.push(Mismatch::TooShort { len });
    } else if len > MAX_RESPONSE_LEN {
        mismatches.push(Mismatch::TooLong { len });
    }

    let prefix_match = match response.get(..EXPECTED_PREFIX.len()) {
        Some(prefix) if prefix == EXPECTED_PREFIX => true,
        Some(prefix) => {
            mismatches.push(Mismatch::Prefix { actual: prefix.to_vec() });
            false
        }
        None => {
            mismatches.push(Mismatch::Missing { pattern: "prefix" });
            false
        }
    };

    let routing_address = response
        .get(EXPECTED_PREFIX.len()..EXPECTED_PREFIX.len() + ROUTING_ADDRESS_LEN)
        .and_then(|bytes| <[u8; 16]>::try_from(bytes).ok());

    let suffix_match = match len.checked_sub(EXPECTED_SUFFIX.len()).map(|start| &response[start..]) {
        Some(suffix) if suffix == EXPECTED_SUFFIX => true,
        Some(suffix) => {
            mismatches.push(Mismatch::Suffix { actual: suffix.to_vec() });
            false
        }
        None => {
            mismatches.push(Mismatch::Missing { pattern: "suffix" });
            false
        }
    };

    ValidationReport { length_valid, prefix_match, suffix_match, routing_address, mismatches }
}

/// A byte that differs between two responses of equal length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteDifference {
    pub position: usize,
    pub first: u8,
    pub second: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseComparison {
    pub length_match: bool,
    /// Empty when the lengths differ.
    pub differences: Vec<ByteDifference>,
}

impl ResponseComparison {
    pub fn identical(&self) -> bool {
        self.length_match && self.differences.is_empty()
    }
}

pub fn compare_responses(first: &[u8], second: &[u8]) -> ResponseComparison {
    if first.len() != second.len() {
        return ResponseComparison { length_match: false, differences: Vec::new() };
    }
    let differences = first
        .iter()
        .zip(second)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(position, (&first, &second))| ByteDifference { position, first, second })
        .collect();
    ResponseComparison { length_match: true, differences }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    pub response_count: usize,
    pub length_consistent: bool,
    /// Length of the first response, if there was one.
    pub common_length: Option<usize>,
    pub consistent_positions: Vec<usize>,
    pub variable_positions: Vec<usize>,
}

impl ConsistencyReport {
    pub fn consistency_percentage(&self) -> f64 {
        match self.common_length {
            Some(len) if len > 0 && self.length_consistent => {
                self.consistent_positions.len() as f64 * 100.0 / len as f64
            }
            _ => 0.0,
        }
    }

    /// Runs of adjacent variable positions, e.g. the echoed routing address.
    pub fn variable_regions(&self) -> Vec<RangeInclusive<usize>> {
        let mut regions: Vec<RangeInclusive<usize>> = Vec::new();
        for &position in &self.variable_positions {
            match regions.last_mut() {
                Some(region) if *region.end() + 1 == position => *region = *region.start()..=position,
                _ => regions.push(position..=position),
            }
        }
        regions
    }
}

/// Which byte positions never change across `responses`. Responses of different lengths
/// are not compared position by position.
pub fn analyze_consistency(responses: &[&[u8]]) -> ConsistencyReport {
    let mut report = ConsistencyReport {
        response_count: responses.len(),
        length_consistent: false,
        common_length: responses.first().map(|r| r.len()),
        consistent_positions: Vec::new(),
        variable_positions: Vec::new(),
    };
    let Some((first, rest)) = responses.split_first() else {
        return report;
    };

    report.length_consistent = rest.iter().all(|r| r.len() == first.len());
    if !report.length_consistent {
        return report;
    }

    for (position, byte) in first.iter().enumerate() {
        if rest.iter().all(|r| r[position] == *byte) {
            report.consistent_positions.push(position);
        } else {
            report.variable_positions.push(position);
        }
    }
    report
}
