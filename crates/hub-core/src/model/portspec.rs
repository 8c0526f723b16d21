//! Destination port specifications
//!
//! A port spec is a comma separated list of single ports (`443`) and
//! inclusive ranges (`8000-8080`). Parsing normalizes the list: whitespace
//! is ignored, entries are sorted and exact duplicates removed, so the
//! rendered form of a parsed spec always parses back to itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum number of port slots a single multiport match accepts.
/// A range consumes two slots.
pub const MULTIPORT_SLOTS: usize = 15;

/// A single port or an inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// A range covering exactly one port
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// A range `start-end`; `start` must be strictly lower than `end`
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(Error::validation(format!(
                "invalid port range {}-{}: start must be lower than end",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Multiport slots consumed by this entry
    pub fn slots(&self) -> usize {
        if self.is_single() { 1 } else { 2 }
    }

    /// Packet-filter syntax (`80` or `8000:8080`)
    pub fn to_match(&self) -> String {
        if self.is_single() {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Normalized destination port specification
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec(Vec<PortRange>);

impl PortSpec {
    /// An empty spec (no port matching)
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parse and normalize a port spec
    ///
    /// # Returns
    ///
    /// - `Ok(PortSpec)`: sorted, deduplicated spec (empty for blank input)
    /// - `Err(Error::Validation)`: malformed token, port above 65535 or
    ///   a range whose start is not lower than its end
    pub fn parse(input: &str) -> Result<Self> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Ok(Self::empty());
        }

        let mut ranges = Vec::new();
        for token in compact.split(',') {
            if token.is_empty() {
                return Err(Error::validation(format!(
                    "invalid port spec '{}': empty entry",
                    input.trim()
                )));
            }
            let range = match token.split_once('-') {
                Some((start, end)) => PortRange::new(parse_port(start)?, parse_port(end)?)?,
                None => PortRange::single(parse_port(token)?),
            };
            ranges.push(range);
        }

        ranges.sort();
        ranges.dedup();
        Ok(Self(ranges))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.0
    }

    /// Split the spec into multiport match arguments of at most
    /// [`MULTIPORT_SLOTS`] slots each, in packet-filter syntax.
    pub fn multiport_chunks(&self) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut used = 0;

        for range in &self.0 {
            if used + range.slots() > MULTIPORT_SLOTS {
                chunks.push(current.join(","));
                current.clear();
                used = 0;
            }
            used += range.slots();
            current.push(range.to_match());
        }
        if !current.is_empty() {
            chunks.push(current.join(","));
        }
        chunks
    }
}

fn parse_port(token: &str) -> Result<u16> {
    let value: u32 = token
        .parse()
        .map_err(|_| Error::validation(format!("invalid port '{}'", token)))?;
    u16::try_from(value)
        .map_err(|_| Error::validation(format!("port {} out of range 0-65535", value)))
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join(","))
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PortSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}
