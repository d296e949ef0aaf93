use crate::constants::{MAX_LABEL_LENGTH, MAX_NAME_LENGTH};
use crate::error::{ResolveError, Result};

/// Validate a host name per RFC 1123 with underscores tolerated.
///
/// A name is valid when it is non-empty, no longer than 253 characters in
/// total, and every dot-separated label is 1-63 characters drawn from
/// `[A-Za-z0-9_-]` without a leading or trailing hyphen.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(ResolveError::InvalidName(name.to_string()));
    }

    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(ResolveError::InvalidName(name.to_string()));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ResolveError::InvalidName(name.to_string()));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ResolveError::InvalidName(name.to_string()));
        }
    }

    Ok(())
}
