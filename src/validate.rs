//! Input validation for subdomain names, addresses and ports
//!
//! These are pure predicates. Callers decide how to report a rejection.

use crate::error::ValidationError;
use std::net::IpAddr;

/// Longest fully-qualified name DNS allows
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// True if `s` is a fully-qualified name such as `app.example.com`
///
/// Every label is 1-63 ASCII alphanumerics or hyphens and may not start or end
/// with a hyphen. At least two labels are required and the final label must be
/// alphabetic with two or more characters.
pub fn validate_subdomain_name(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return false;
    }

    let labels: Vec<&str> = s.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    let valid_labels = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !valid_labels {
        return false;
    }

    // Top-level label
    labels
        .last()
        .map(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
        .unwrap_or(false)
}

/// True if `s` parses as an IPv4 or IPv6 literal
pub fn validate_address(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// True if `s` is all digits and names a port in 1..=65535
pub fn validate_port(s: &str) -> bool {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(s.parse::<u16>(), Ok(port) if port >= 1)
}

/// Parse a subdomain name, rejecting it with a typed error
pub fn parse_subdomain_name(s: &str) -> Result<String, ValidationError> {
    if validate_subdomain_name(s) {
        Ok(s.to_string())
    } else {
        Err(ValidationError::Subdomain(s.to_string()))
    }
}

/// Parse an address literal, rejecting it with a typed error
pub fn parse_address(s: &str) -> Result<IpAddr, ValidationError> {
    s.parse().map_err(|_| ValidationError::Address(s.to_string()))
}

/// Parse a port, rejecting it with a typed error
pub fn parse_port(s: &str) -> Result<u16, ValidationError> {
    if validate_port(s) {
        s.parse().map_err(|_| ValidationError::Port(s.to_string()))
    } else {
        Err(ValidationError::Port(s.to_string()))
    }
}
