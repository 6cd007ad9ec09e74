//! Per-request route selection.
//!
//! Routes are examined in snapshot order and the first match wins: the
//! route's `path_prefix` must prefix the request path, and its `domain`, if
//! set, must equal the request host (ignoring any port in the header).

use agw_core::Route;

pub fn find_route<'s>(routes: &'s [Route], path: &str, host: Option<&str>) -> Option<&'s Route> {
    let host = host.map(strip_port);
    routes.iter().find(|route| {
        if !path.starts_with(&route.path_prefix) {
            return false;
        }
        match &route.domain {
            Some(domain) => host == Some(domain.as_str()),
            None => true,
        }
    })
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals keep their brackets; everything else drops the :port.
    if host.starts_with('[') {
        match host.rfind(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, _)) => name,
            None => host,
        }
    }
}
