//! Library version query.

const MAJOR: u32 = parse(env!("CARGO_PKG_VERSION_MAJOR"));
const MINOR: u32 = parse(env!("CARGO_PKG_VERSION_MINOR"));
const PATCH: u32 = parse(env!("CARGO_PKG_VERSION_PATCH"));

/// Library version as `major * 10000 + minor * 100 + patch`, e.g. 10000 for
/// 1.0.0.
pub const VERSION_NUMBER: u32 = MAJOR * 10000 + MINOR * 100 + PATCH;

pub fn number() -> u32 {
    VERSION_NUMBER
}

/// Version with two-digit minor and patch, e.g. `1.00.00`.
pub fn string() -> String {
    format!("{MAJOR}.{MINOR:02}.{PATCH:02}")
}

const fn parse(digits: &str) -> u32 {
    let bytes = digits.as_bytes();
    let mut value = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(number(), 10000);
        assert_eq!(string(), "1.00.00");
        assert_eq!(parse("42"), 42);
    }
}
