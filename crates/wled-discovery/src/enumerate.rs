//! Expansion of user-supplied network specifications into candidate addresses
//!
//! Supported forms, checked in this order:
//! - `192.168.1.0/24` CIDR (prefix 0-30, network and broadcast excluded, at most 254 hosts)
//! - `192.168.1.10-192.168.1.20` range within the last octet
//! - `192.168.1.*` wildcard over hosts 1-254
//! - anything else is a single address or hostname, passed through unchanged

use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Most hosts a CIDR block may expand to
pub const MAX_CIDR_HOSTS: u64 = 254;

/// Longest accepted CIDR prefix
pub const MAX_CIDR_PREFIX: u8 = 30;

/// Ceiling on addresses in a single scan
pub const MAX_SCAN_ADDRESSES: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Please enter a subnet to scan")]
    Empty,
    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),
    #[error("Invalid address range: {0}")]
    InvalidRange(String),
    #[error("Invalid wildcard: {0}")]
    InvalidWildcard(String),
    #[error("Subnet too large ({count} addresses, max {max}). Use a smaller range.")]
    TooLarge { count: usize, max: usize },
}

/// A parsed network specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpec {
    Cidr { network: Ipv4Addr, prefix: u8 },
    Range { start: Ipv4Addr, end: Ipv4Addr },
    Wildcard { base: [u8; 3] },
    Single(String),
}

impl FromStr for AddressSpec {
    type Err = SpecError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SpecError::Empty);
        }

        if input.contains('/') {
            parse_cidr(input)
        } else if is_numeric_range(input) {
            parse_range(input)
        } else if input.contains('*') {
            parse_wildcard(input)
        } else {
            Ok(AddressSpec::Single(input.to_string()))
        }
    }
}

impl AddressSpec {
    /// Expand into the ordered candidate list
    pub fn expand(&self) -> Vec<String> {
        match self {
            AddressSpec::Cidr { network, prefix } => {
                let base = u32::from(*network);
                (1..=cidr_host_count(*prefix) as u32)
                    .map(|i| Ipv4Addr::from(base | i).to_string())
                    .collect()
            }
            AddressSpec::Range { start, end } => {
                let [a, b, c, first] = start.octets();
                let last = end.octets()[3];
                (first..=last)
                    .map(|d| Ipv4Addr::new(a, b, c, d).to_string())
                    .collect()
            }
            AddressSpec::Wildcard { base: [a, b, c] } => (1..=254u8)
                .map(|d| Ipv4Addr::new(*a, *b, *c, d).to_string())
                .collect(),
            AddressSpec::Single(address) => vec![address.clone()],
        }
    }
}

/// Hosts emitted for a prefix: every address strictly between network and
/// broadcast, capped at [`MAX_CIDR_HOSTS`]
pub fn cidr_host_count(prefix: u8) -> u64 {
    let total = 1u64 << (32 - prefix.min(32) as u32);
    total.saturating_sub(2).min(MAX_CIDR_HOSTS)
}

/// Expand a specification; malformed input yields an empty list
pub fn enumerate(input: &str) -> Vec<String> {
    input
        .parse::<AddressSpec>()
        .map(|spec| spec.expand())
        .unwrap_or_default()
}

/// Validate and expand a specification for scanning, enforcing `max` addresses
pub fn plan(input: &str, max: usize) -> Result<Vec<String>, SpecError> {
    let addresses = input.parse::<AddressSpec>()?.expand();
    if addresses.len() > max {
        return Err(SpecError::TooLarge {
            count: addresses.len(),
            max,
        });
    }
    Ok(addresses)
}

fn parse_cidr(input: &str) -> Result<AddressSpec, SpecError> {
    let invalid = || SpecError::InvalidCidr(input.to_string());

    let (ip, prefix) = input.split_once('/').ok_or_else(invalid)?;
    let prefix = prefix.trim();
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > MAX_CIDR_PREFIX {
        return Err(invalid());
    }
    let ip = parse_octets(ip).ok_or_else(invalid)?;

    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    Ok(AddressSpec::Cidr { network, prefix })
}

fn parse_range(input: &str) -> Result<AddressSpec, SpecError> {
    let invalid = || SpecError::InvalidRange(input.to_string());

    let (start, end) = input.split_once('-').ok_or_else(invalid)?;
    let start = parse_octets(start).ok_or_else(invalid)?;
    let end = parse_octets(end).ok_or_else(invalid)?;

    let (s, e) = (start.octets(), end.octets());
    if s[..3] != e[..3] || s[3] > e[3] {
        return Err(invalid());
    }
    Ok(AddressSpec::Range { start, end })
}

fn parse_wildcard(input: &str) -> Result<AddressSpec, SpecError> {
    let invalid = || SpecError::InvalidWildcard(input.to_string());

    let parts: Vec<&str> = input.split('.').collect();
    if parts.len() != 4 || parts[3] != "*" {
        return Err(invalid());
    }
    let mut base = [0u8; 3];
    for (slot, part) in base.iter_mut().zip(&parts[..3]) {
        *slot = parse_octet(part).ok_or_else(invalid)?;
    }
    Ok(AddressSpec::Wildcard { base })
}

/// A range is only recognized when the input is purely dotted numbers, so
/// hostnames like `wled-kitchen.local` fall through to a single address
fn is_numeric_range(input: &str) -> bool {
    input.contains('-')
        && input
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c.is_whitespace())
}

fn parse_octets(input: &str) -> Option<Ipv4Addr> {
    let parts: Vec<&str> = input.trim().split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        *slot = parse_octet(part)?;
    }
    Some(Ipv4Addr::from(octets))
}

fn parse_octet(input: &str) -> Option<u8> {
    if input.is_empty() || input.len() > 3 || !input.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    input.parse().ok()
}
