use crate::{domain::PhoneKey, errors::Error, Result};

pub const MIN_DIGITS: usize = 9;
pub const MAX_DIGITS: usize = 15;

/// Strip everything but ASCII digits and validate the length.
///
/// `"+1 (555) 123-4567"` becomes `15551234567`. Pure; no side effects.
pub fn normalize(raw: &str) -> Result<PhoneKey> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
        return Err(Error::InvalidPhoneFormat {
            digits: digits.len(),
        });
    }
    Ok(PhoneKey(digits))
}
