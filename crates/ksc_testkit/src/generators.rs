//! Property-based test generators using proptest.

use proptest::prelude::*;

/// Characters the server forbids in storage names.
pub const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>'];

/// A valid product, version or section name.
pub fn storage_name() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.-]{1,31}"
}

/// A name of valid length containing at least one forbidden character.
pub fn forbidden_name() -> impl Strategy<Value = String> {
    ("[A-Za-z0-9]{0,14}", prop::sample::select(FORBIDDEN), "[A-Za-z0-9]{0,14}")
        .prop_map(|(head, bad, tail)| format!("{}{}{}", head, bad, tail))
}

/// A storage address position, 0 to 2.
pub fn address_position() -> impl Strategy<Value = usize> {
    0usize..3
}

/// Printable credential text, including quotes and non-ASCII.
pub fn credential_text() -> impl Strategy<Value = String> {
    "\\PC{1,24}"
}
