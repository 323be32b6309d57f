//! Validation of registration fields that do not depend on manager state.

use crate::error::RegistrationError;

/// Device plugin API version implemented by this manager.
pub const API_VERSION: &str = "v1alpha";

/// Every API version the registration endpoint accepts.
pub const SUPPORTED_API_VERSIONS: &[&str] = &[API_VERSION];

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_TYPE_LEN: usize = 63;

/// Check that `name` is a vendor-namespaced resource name (`<domain>/<type>`).
///
/// The domain must be a lowercase DNS subdomain and the type a qualified
/// name segment (`[A-Za-z0-9._-]`, alphanumeric at both ends).
pub fn validate_resource_name(name: &str) -> Result<(), RegistrationError> {
    let invalid = |reason: &str| RegistrationError::InvalidResourceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("resource name is empty"));
    }

    let (domain, kind) = name
        .split_once('/')
        .ok_or_else(|| invalid("expected '<domain>/<type>'"))?;

    if kind.contains('/') {
        return Err(invalid("more than one '/' separator"));
    }
    if domain.is_empty() {
        return Err(invalid("vendor domain is empty"));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("vendor domain is too long"));
    }
    for label in domain.split('.') {
        if !is_dns_label(label) {
            return Err(invalid(&format!("'{label}' is not a valid DNS label")));
        }
    }

    if kind.is_empty() {
        return Err(invalid("resource type is empty"));
    }
    if kind.len() > MAX_TYPE_LEN {
        return Err(invalid("resource type is too long"));
    }
    if !is_name_segment(kind) {
        return Err(invalid(
            "resource type must be alphanumeric, '-', '_' or '.', starting and ending alphanumeric",
        ));
    }

    Ok(())
}

/// Check that `version` is one of [`SUPPORTED_API_VERSIONS`].
pub fn validate_api_version(version: &str) -> Result<(), RegistrationError> {
    if SUPPORTED_API_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(RegistrationError::UnsupportedVersion {
            version: version.to_string(),
        })
    }
}

fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

fn is_name_segment(segment: &str) -> bool {
    let alnum_at = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    alnum_at(segment.chars().next())
        && alnum_at(segment.chars().last())
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_vendor_namespaced_names() {
        for name in [
            "fake-domain/resource",
            "nvidia.com/gpu",
            "vendor.example/fpga_v2",
            "intel.com/sriov.net-a",
        ] {
            assert!(validate_resource_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_rejects_malformed_names() {
        for name in [
            "",
            "gpu",
            "/gpu",
            "nvidia.com/",
            "a/b/c",
            "Nvidia.com/gpu",
            "-bad.com/gpu",
            "nvidia..com/gpu",
            "nvidia.com/-gpu",
            "nvidia.com/gpu!",
        ] {
            let err = validate_resource_name(name).unwrap_err();
            assert_eq!(err.code(), "INVALID_RESOURCE_NAME", "{name} should be invalid");
        }
    }

    #[test]
    fn test_api_version() {
        assert!(validate_api_version(API_VERSION).is_ok());
        let err = validate_api_version("v1beta1").unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnsupportedVersion {
                version: "v1beta1".into()
            }
        );
        assert!(validate_api_version("").is_err());
    }
}
