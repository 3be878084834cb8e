//! Service and characteristic identifiers.
//!
//! Identifiers travel as canonical strings: lowercase, hyphenated
//! 8-4-4-4-12 hex groups. Short 16-bit and 32-bit forms are expanded
//! against the Bluetooth base UUID.

use uuid::Uuid;

use crate::error::{ParseError, ParseResult};

/// The Bluetooth base UUID that short identifiers are expanded against.
pub const BLUETOOTH_BASE_UUID: Uuid =
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

/// Expand a 16-bit assigned number into a full UUID.
#[must_use]
pub const fn from_short(short: u16) -> Uuid {
    from_u32(short as u32)
}

/// Expand a 32-bit assigned number into a full UUID.
#[must_use]
pub const fn from_u32(value: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((value as u128) << 96))
}

/// Format a UUID in canonical form.
#[must_use]
pub fn format_uuid(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string()
}

/// Parse an identifier in full, simple, braced, or short form.
///
/// # Examples
///
/// ```
/// use quickblue_types::uuid::{from_short, parse_uuid};
///
/// let gap = from_short(0x1800);
/// assert_eq!(parse_uuid("1800").unwrap(), gap);
/// assert_eq!(parse_uuid("00001800-0000-1000-8000-00805F9B34FB").unwrap(), gap);
/// ```
pub fn parse_uuid(input: &str) -> ParseResult<Uuid> {
    let trimmed = input.trim();
    let is_hex = !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_hexdigit());

    match trimmed.len() {
        4 if is_hex => u16::from_str_radix(trimmed, 16)
            .map(from_short)
            .map_err(|_| ParseError::InvalidUuid(input.to_string())),
        8 if is_hex => u32::from_str_radix(trimmed, 16)
            .map(from_u32)
            .map_err(|_| ParseError::InvalidUuid(input.to_string())),
        _ => Uuid::parse_str(trimmed).map_err(|_| ParseError::InvalidUuid(input.to_string())),
    }
}

/// Parse and re-format an identifier into canonical form.
pub fn normalize_uuid(input: &str) -> ParseResult<String> {
    parse_uuid(input).map(|uuid| format_uuid(&uuid))
}

/// Whether an identifier string is already canonical.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    input.len() == 36
        && Uuid::parse_str(input).is_ok_and(|uuid| format_uuid(&uuid) == input)
}


/// Property-based tests for identifier normalization.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Normalization never panics on arbitrary input.
        #[test]
        fn normalize_never_panics(input in ".*") {
            let _ = normalize_uuid(&input);
        }

        /// Any accepted identifier comes back in canonical form.
        #[test]
        fn normalized_output_is_canonical(value: u128, upper: bool) {
            let raw = Uuid::from_u128(value).hyphenated().to_string();
            let input = if upper { raw.to_uppercase() } else { raw };
            let normalized = normalize_uuid(&input).unwrap();
            prop_assert!(is_canonical(&normalized));
            prop_assert_eq!(normalized, format_uuid(&Uuid::from_u128(value)));
        }

        /// Short forms always land on the base UUID.
        #[test]
        fn short_form_keeps_base_suffix(short: u16) {
            let normalized = normalize_uuid(&format!("{short:04X}")).unwrap();
            prop_assert!(normalized.ends_with("-0000-1000-8000-00805f9b34fb"));
            prop_assert_eq!(&normalized[4..8], format!("{short:04x}"));
        }
    }
}
