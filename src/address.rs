use std::sync::LazyLock;

use regex::Regex;

/// One `@`, something before it, and a dot somewhere after it. The mail
/// server has the final say on deliverability.
static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@]+@[^@]*\.[^@]*$").unwrap_or_else(|err| panic!("bad address regex: {err}"))
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("no email addresses were provided")]
    EmptyInput,
    #[error("invalid email format detected for: {}", .0.join(", "))]
    InvalidFormat(Vec<String>),
}

pub fn check_address(address: &str) -> bool {
    ADDRESS.is_match(address)
}

/// Splits a comma-separated recipient list and checks every entry.
///
/// Order and duplicates are preserved.
pub fn validate_recipients(raw: &str) -> Result<Vec<String>, AddressError> {
    let addresses: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect();

    if addresses.is_empty() {
        return Err(AddressError::EmptyInput);
    }

    let invalid: Vec<String> = addresses
        .iter()
        .filter(|address| !check_address(address))
        .cloned()
        .collect();

    if invalid.is_empty() {
        Ok(addresses)
    } else {
        Err(AddressError::InvalidFormat(invalid))
    }
}

pub fn validate_single_address(raw: &str) -> Result<(), AddressError> {
    let address = raw.trim();
    if address.is_empty() {
        Err(AddressError::EmptyInput)
    } else if check_address(address) {
        Ok(())
    } else {
        Err(AddressError::InvalidFormat(vec![address.to_owned()]))
    }
}
