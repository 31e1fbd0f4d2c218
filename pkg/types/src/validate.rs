use anyhow::{Result, bail};

use crate::labels::LabelSet;

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Longest replica-set name that still leaves room for `-<ordinal>` in pod names.
const MAX_STATEFULSET_NAME: usize = 52;

/// A replica-set name must stay a valid name after appending `-<ordinal>`.
pub fn validate_statefulset_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name.len() > MAX_STATEFULSET_NAME {
        bail!(
            "statefulset name '{}' exceeds {} characters (got {})",
            name,
            MAX_STATEFULSET_NAME,
            name.len()
        );
    }
    Ok(())
}

fn is_label_segment(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Validate a label key: `[prefix/]name`, where prefix is a DNS subdomain.
pub fn validate_label_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 {
            bail!("label key '{}' has an invalid prefix length", key);
        }
        if !prefix.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !part.starts_with('-')
                && !part.ends_with('-')
        }) {
            bail!("label key '{}' has an invalid DNS prefix", key);
        }
    }
    if !is_label_segment(name) {
        bail!(
            "label key '{}' must be 1-63 alphanumeric characters, '-', '_' or '.', starting and ending alphanumeric",
            key
        );
    }
    Ok(())
}

/// Validate a label value: empty, or a label segment.
pub fn validate_label_value(value: &str) -> Result<()> {
    if !value.is_empty() && !is_label_segment(value) {
        bail!(
            "label value '{}' must be at most 63 alphanumeric characters, '-', '_' or '.', starting and ending alphanumeric",
            value
        );
    }
    Ok(())
}

pub fn validate_labels(labels: &LabelSet) -> Result<()> {
    for (key, value) in labels {
        validate_label_key(key)?;
        validate_label_value(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(validate_name("nginx").is_ok());
        assert!(validate_name("web-0").is_ok());
        assert!(validate_name("app-123").is_ok());
        assert!(validate_name("a").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("My-App").is_err());
        assert!(validate_name("my_app").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn statefulset_names_leave_room_for_ordinals() {
        assert!(validate_statefulset_name(&"a".repeat(52)).is_ok());
        assert!(validate_statefulset_name(&"a".repeat(53)).is_err());
    }

    #[test]
    fn label_keys_and_values() {
        assert!(validate_label_key("app").is_ok());
        assert!(validate_label_key("app.kubernetes.io/name").is_ok());
        assert!(validate_label_key("tier_2").is_ok());
        assert!(validate_label_key("").is_err());
        assert!(validate_label_key("/name").is_err());
        assert!(validate_label_key("Example.com/name").is_err());
        assert!(validate_label_key("-app").is_err());

        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("frontend").is_ok());
        assert!(validate_label_value("v1.2_rc-3").is_ok());
        assert!(validate_label_value("bad value").is_err());
        assert!(validate_label_value(&"v".repeat(64)).is_err());
    }
}
