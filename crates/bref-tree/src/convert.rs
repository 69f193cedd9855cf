use bref_error::BrefError;
use bref_types::ParseError;

/// Convert a parse failure found in the metadata block at `block`.
///
/// Wrong magic means wrong format; every other violation in live metadata
/// is corruption of that block.
#[must_use]
pub fn parse_error_at(block: u64, err: &ParseError) -> BrefError {
    match err {
        ParseError::InvalidMagic { .. } => BrefError::Format(err.to_string()),
        ParseError::InsufficientData { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => BrefError::Corruption {
            block,
            detail: err.to_string(),
        },
    }
}
