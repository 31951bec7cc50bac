//! Host negotiation.
//!
//! Picks the host a key is bound on from what the transport reports.

use crate::traits::HostInfo;

/// Negotiate the best host for a key.
///
/// Hosts are tried in `preference` order, or in the order the transport
/// reported them if no preference is configured. With `require_trusted`,
/// untrusted hosts are skipped. `fallback` is accepted whenever it is
/// available, trusted or not.
#[must_use]
pub fn negotiate_host<'a>(
    preference: &[String],
    available: &'a [HostInfo],
    require_trusted: bool,
    fallback: Option<&str>,
) -> Option<&'a HostInfo> {
    let acceptable = |host: &&HostInfo| host.trusted || !require_trusted;

    let preferred = if preference.is_empty() {
        available.iter().find(acceptable)
    } else {
        preference
            .iter()
            .filter_map(|name| available.iter().find(|h| &h.name == name))
            .find(acceptable)
    };

    preferred.or_else(|| {
        let fallback = fallback?;
        available.iter().find(|h| h.name == fallback)
    })
}
