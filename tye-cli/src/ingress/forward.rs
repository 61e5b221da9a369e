//! Header rewriting for forwarded requests and copied responses.

use std::net::IpAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Version;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Connection-scoped headers that must not travel past this hop.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
    .contains(name)
        || name.as_str() == "keep-alive"
}

pub fn protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    }
}

/// Headers for the downstream request.
///
/// `Host` is left to the client (it addresses the target), every `Cookie`
/// value is folded into one, and the `Via` / `X-Forwarded-*` set is added.
pub fn request_headers(incoming: &HeaderMap, version: Version, client: IpAddr) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(incoming.len() + 4);
    for (name, value) in incoming {
        if is_hop_by_hop(name) || name == header::HOST || name == header::COOKIE {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let cookies: Vec<&str> = incoming
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if !cookies.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cookies.join("; ")) {
            out.insert(header::COOKIE, value);
        }
    }

    if let Ok(via) = HeaderValue::from_str(&format!("{} Tye", protocol(version))) {
        out.append(header::VIA, via);
    }
    out.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Some(host) = incoming.get(header::HOST) {
        out.insert(X_FORWARDED_HOST, host.clone());
    }

    let forwarded_for = match incoming.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior, client),
        _ => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        out.insert(X_FORWARDED_FOR, value);
    }
    out
}

/// Copy upstream response headers onto `out`, replacing any header of the
/// same name. `Transfer-Encoding` is dropped afterwards: the body has
/// already been de-chunked by the client.
pub fn copy_response_headers(upstream: &HeaderMap, out: &mut HeaderMap) {
    for name in upstream.keys() {
        out.remove(name);
        for value in upstream.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out.remove(header::TRANSFER_ENCODING);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))
    }

    #[test]
    fn test_cookies_are_coalesced() {
        let mut incoming = HeaderMap::new();
        incoming.append(header::COOKIE, HeaderValue::from_static("a=1"));
        incoming.append(header::COOKIE, HeaderValue::from_static("b=2"));

        let out = request_headers(&incoming, Version::HTTP_11, client());
        let cookies: Vec<&str> = out
            .get_all(header::COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["a=1; b=2"]);
    }

    #[test]
    fn test_forwarding_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("app.example.com:8080"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        incoming.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let out = request_headers(&incoming, Version::HTTP_11, client());
        assert_eq!(out[header::VIA], "HTTP/1.1 Tye");
        assert_eq!(out[&X_FORWARDED_PROTO], "http");
        assert_eq!(out[&X_FORWARDED_HOST], "app.example.com:8080");
        assert_eq!(out[&X_FORWARDED_FOR], "10.1.2.3");
        assert_eq!(out[header::ACCEPT], "text/html");
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
    }

    #[test]
    fn test_forwarded_for_is_appended() {
        let mut incoming = HeaderMap::new();
        incoming.insert(&X_FORWARDED_FOR, HeaderValue::from_static("192.0.2.1"));
        incoming.insert(header::VIA, HeaderValue::from_static("HTTP/1.1 edge"));

        let out = request_headers(&incoming, Version::HTTP_10, client());
        assert_eq!(out[&X_FORWARDED_FOR], "192.0.2.1, 10.1.2.3");
        let via: Vec<&str> = out
            .get_all(header::VIA)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(via, vec!["HTTP/1.1 edge", "HTTP/1.0 Tye"]);
    }

    #[test]
    fn test_response_headers_replace_and_strip_transfer_encoding() {
        let mut upstream = HeaderMap::new();
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let mut out = HeaderMap::new();
        out.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        copy_response_headers(&upstream, &mut out);

        assert_eq!(out[header::CONTENT_TYPE], "application/json");
        assert_eq!(out.get_all(header::SET_COOKIE).iter().count(), 2);
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn test_protocol_labels() {
        assert_eq!(protocol(Version::HTTP_11), "HTTP/1.1");
        assert_eq!(protocol(Version::HTTP_2), "HTTP/2");
    }
}
