use std::sync::LazyLock;

use error_stack::Report;
use regex::Regex;

use super::partitioning::supports;
use super::DeviceManagerError;
use crate::config::ResourceUnitStrategy;
use crate::platform::npu::Arch;

pub const RESOURCE_DOMAIN: &str = "furiosa.ai";

const DNS_SUBDOMAIN_MAX_LEN: usize = 253;
static DNS_SUBDOMAIN_PATTERN: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
});

/// The extended resource name pods request, e.g. `furiosa.ai/rngd` or
/// `furiosa.ai/rngd-2core.12gb`.
///
/// Partitioned names carry the core count and the board memory those cores
/// account for.
pub fn resource_name(
    arch: Arch,
    strategy: ResourceUnitStrategy,
) -> Result<String, Report<DeviceManagerError>> {
    if !supports(arch, strategy) {
        return Err(Report::new(DeviceManagerError::UnsupportedStrategy {
            arch,
            strategy,
        }));
    }

    let endpoint = match strategy.core_size() {
        None => arch.to_string(),
        Some(cores) => {
            let memory_gb = cores * arch.memory_gb() / arch.total_cores();
            format!("{arch}-{cores}core.{memory_gb}gb")
        }
    };
    validate_dns_subdomain(&endpoint)?;

    Ok(format!("{RESOURCE_DOMAIN}/{endpoint}"))
}

/// Resource name without its domain, used to name sockets.
pub fn endpoint_name(resource_name: &str) -> &str {
    resource_name
        .split_once('/')
        .map_or(resource_name, |(_, endpoint)| endpoint)
}

fn validate_dns_subdomain(name: &str) -> Result<(), Report<DeviceManagerError>> {
    let invalid = |reason: &str| DeviceManagerError::InvalidResourceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.len() > DNS_SUBDOMAIN_MAX_LEN {
        return Err(Report::new(invalid(&format!(
            "must be no more than {DNS_SUBDOMAIN_MAX_LEN} characters"
        ))));
    }
    let pattern = DNS_SUBDOMAIN_PATTERN.as_ref().map_err(|e| {
        Report::new(e.clone()).change_context(invalid("subdomain pattern failed to compile"))
    })?;
    if !pattern.is_match(name) {
        return Err(Report::new(invalid(
            "must consist of lower case alphanumeric characters, '-' or '.', \
             and must start and end with an alphanumeric character",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn names_per_strategy() {
        let cases = [
            (Arch::Rngd, ResourceUnitStrategy::Generic, "furiosa.ai/rngd"),
            (Arch::Rngd, ResourceUnitStrategy::SingleCore, "furiosa.ai/rngd-1core.6gb"),
            (Arch::Rngd, ResourceUnitStrategy::DualCore, "furiosa.ai/rngd-2core.12gb"),
            (Arch::Rngd, ResourceUnitStrategy::QuadCore, "furiosa.ai/rngd-4core.24gb"),
            (Arch::Warboy, ResourceUnitStrategy::Generic, "furiosa.ai/warboy"),
            (Arch::Warboy, ResourceUnitStrategy::SingleCore, "furiosa.ai/warboy-1core.8gb"),
            (Arch::Warboy, ResourceUnitStrategy::DualCore, "furiosa.ai/warboy-2core.16gb"),
        ];

        for (arch, strategy, expected) in cases {
            assert_eq!(resource_name(arch, strategy).unwrap(), expected);
        }
    }

    #[test]
    fn unsupported_strategy() {
        let err = resource_name(Arch::Warboy, ResourceUnitStrategy::QuadCore).unwrap_err();
        assert!(matches!(
            err.current_context(),
            DeviceManagerError::UnsupportedStrategy { .. }
        ));
    }

    #[test]
    fn dns_subdomain_rules() {
        for good in ["rngd", "rngd-2core.12gb", "a.b-c.d", "0"] {
            assert!(validate_dns_subdomain(good).is_ok(), "{good}");
        }
        let too_long = "a".repeat(DNS_SUBDOMAIN_MAX_LEN + 1);
        for bad in ["", "RNGD", "-rngd", "rngd-", "rngd..x", "rngd_2core", too_long.as_str()] {
            let err = validate_dns_subdomain(bad).unwrap_err();
            assert!(
                matches!(
                    err.current_context(),
                    DeviceManagerError::InvalidResourceName { .. }
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn endpoint_strips_domain() {
        assert_eq!(endpoint_name("furiosa.ai/rngd-2core.12gb"), "rngd-2core.12gb");
        assert_eq!(endpoint_name("rngd"), "rngd");
    }
}
