//! Naming rules shared by topics and service endpoints.
//!
//! A valid name is 1..=256 characters of ASCII letters, digits and `_ - . / : @`,
//! with no empty `/`-separated segment (so no leading, trailing or doubled `/`).

use crate::utils::error::{MessageRouterError, Result};

pub const MAX_NAME_LENGTH: usize = 256;

fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@');

    name.chars().all(allowed) && name.split('/').all(|segment| !segment.is_empty())
}

pub fn is_valid_topic_name(topic: &str) -> bool {
    is_valid_name(topic)
}

pub fn is_valid_endpoint(endpoint: &str) -> bool {
    is_valid_name(endpoint)
}

pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    if is_valid_endpoint(endpoint) {
        Ok(())
    } else {
        Err(MessageRouterError::InvalidEndpoint(endpoint.to_string()))
    }
}
