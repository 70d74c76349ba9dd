//! Pure address resolution from endpoint subsets.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use k8s_openapi::api::core::v1::EndpointSubset;

use crate::config::Port;
use crate::error::WatchError;

/// Resolves one endpoint subset into a set of dialable addresses.
///
/// A subset with an empty port list cannot be resolved at all and fails with
/// [`WatchError::NoPort`]; the caller must treat this as a failure of the
/// whole event, since skipping the subset would leave stale partial state.
///
/// A named port with no matching entry yields an empty set rather than an
/// error: subsets without the annotation simply contribute no addresses.
pub(crate) fn subset_addresses(
    port: &Port,
    subset: &EndpointSubset,
) -> Result<HashSet<SocketAddr>, WatchError> {
    let ports = subset.ports.as_deref().unwrap_or_default();
    if ports.is_empty() {
        return Err(WatchError::NoPort);
    }

    let number = match port {
        Port::First => u16::try_from(ports[0].port).ok(),
        Port::Name(name) => ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(|p| u16::try_from(p.port).ok()),
        Port::Number(n) => Some(*n),
    };

    let Some(number) = number else {
        return Ok(HashSet::new());
    };

    let mut addrs = HashSet::new();
    for address in subset.addresses.as_deref().unwrap_or_default() {
        // The registry delivers IPs; anything unparseable cannot form a
        // dialable address and is skipped.
        if let Ok(ip) = address.ip.parse::<IpAddr>() {
            addrs.insert(SocketAddr::new(ip, number));
        }
    }

    Ok(addrs)
}
