use crate::store::{HashOn, Upstream};
use http::HeaderMap;
use std::net::IpAddr;

/// Request attributes the consistent hash can draw from.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated consumer, when an auth plugin resolved one.
    pub consumer_id: Option<String>,
    /// Authenticated credential, used when no consumer is known.
    pub credential_id: Option<String>,
    pub remote_addr: Option<IpAddr>,
    pub headers: HeaderMap,
}

/// Computes the 32-bit consistent-hash key for a request, per the
/// upstream's policy. Two passes at most: the primary mode, then the
/// configured fallback when the primary yields no identifier. Returns
/// `None` when hashing is off or no identifier could be found.
pub fn create_hash(upstream: &Upstream, ctx: &RequestContext) -> Option<u32> {
    if upstream.hash_on == HashOn::None {
        return None;
    }

    let mut mode = upstream.hash_on;
    let mut header_field = upstream.hash_on_header.as_deref();

    for pass in 0..2 {
        let identifier = match mode {
            HashOn::None => return None,
            HashOn::Consumer => ctx
                .consumer_id
                .clone()
                .or_else(|| ctx.credential_id.clone()),
            HashOn::Ip => ctx.remote_addr.map(|addr| addr.to_string()),
            HashOn::Header => header_field.and_then(|name| header_value(&ctx.headers, name)),
        };

        if let Some(identifier) = identifier {
            return Some(crc32fast::hash(identifier.as_bytes()));
        }

        if pass == 0 {
            mode = upstream.hash_fallback;
            header_field = upstream.hash_fallback_header.as_deref();
        }
    }

    None
}

/// Multi-valued headers concatenate in header order with no separator.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let joined: String = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}
