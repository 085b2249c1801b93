//! Domain path handling.
//!
//! A domain is the user visible container, named by an absolute path
//! like `/home/alice/sample.h6`. Its store key is the path with the
//! leading slash stripped and `/.domain.json` appended, so that child
//! domains nest under their parent's key prefix.

use hyper::{Body, Request};
use lazy_static::lazy_static;
use regex::Regex;
use url::form_urlencoded;

use crate::error::{ServiceError, ServiceResult};

pub const DOMAIN_JSON_SUFFIX: &str = "/.domain.json";
pub const TOP_LEVEL_DOMAINS_KEY: &str = "topleveldomains.txt";

lazy_static! {
    static ref SEGMENT_RE: Regex = Regex::new(r"^[A-Za-z0-9_\-\.]+$").unwrap();
}

pub fn is_valid_domain(domain: &str) -> bool {
    if !domain.starts_with('/') || domain.ends_with('/') || domain.len() < 2 {
        return false;
    }
    domain[1..]
        .split('/')
        .all(|seg| !seg.is_empty() && !seg.contains("..") && SEGMENT_RE.is_match(seg))
}

pub fn validate_domain(domain: &str) -> ServiceResult<()> {
    if is_valid_domain(domain) {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!("invalid domain: {}", domain)))
    }
}

/// Store key for the domain record.
pub fn domain_key(domain: &str) -> String {
    format!("{}{}", &domain[1..], DOMAIN_JSON_SUFFIX)
}

/// Recover the domain path from its store key.
pub fn domain_from_key(key: &str) -> Option<String> {
    key.strip_suffix(DOMAIN_JSON_SUFFIX)
        .map(|path| format!("/{}", path))
}

pub fn is_domain_key(key: &str) -> bool {
    key.ends_with(DOMAIN_JSON_SUFFIX)
}

/// Parent domain path, or `None` for a top level domain.
pub fn parent_domain(domain: &str) -> Option<String> {
    let pos = domain.rfind('/')?;
    if pos == 0 {
        None
    } else {
        Some(domain[..pos].to_string())
    }
}

/// Key of the child-domain index file for a folder, or the bucket
/// level index for the top level.
pub fn domains_index_key(domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("{}/.domains.txt", &domain[1..]),
        None => TOP_LEVEL_DOMAINS_KEY.to_string(),
    }
}

/// Key of a per-domain collection index file (`.groups.txt` etc.).
pub fn collection_index_key(domain: &str, collection: &str) -> String {
    format!("{}/.{}.txt", &domain[1..], collection)
}

/// Convert a DNS-style domain (`sample.alice.home`) to path form
/// (`/home/alice/sample`). Values that already carry a leading slash
/// pass through untouched.
fn dns_to_path(value: &str) -> String {
    if value.starts_with('/') {
        return value.to_string();
    }
    let mut path = String::new();
    for seg in value.split('.').rev() {
        path.push('/');
        path.push_str(seg);
    }
    path
}

/// Extract the target domain from the request: the `domain` query
/// param, then the `host` query param, then the `Host` header.
pub fn domain_from_request(req: &Request<Body>) -> ServiceResult<String> {
    let mut domain = None;
    let mut host_param = None;
    if let Some(query) = req.uri().query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "domain" => domain = Some(value.into_owned()),
                "host" => host_param = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    let raw = match domain.or(host_param) {
        Some(value) => value,
        None => {
            let host = req
                .headers()
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| ServiceError::BadRequest("no domain provided".to_string()))?;
            // strip any port
            host.split(':').next().unwrap_or("").to_string()
        }
    };

    let path = dns_to_path(&raw);
    validate_domain(&path)?;
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_valid_domains() {
        assert!(is_valid_domain("/home/alice/sample.h6"));
        assert!(is_valid_domain("/home"));
        assert!(!is_valid_domain("home/alice"));
        assert!(!is_valid_domain("/home/"));
        assert!(!is_valid_domain("/home//alice"));
        assert!(!is_valid_domain("/home/../etc"));
        assert!(!is_valid_domain("/"));
    }

    #[test]
    fn test_domain_key_round_trip() {
        let key = domain_key("/home/alice/sample.h6");
        assert_eq!(key, "home/alice/sample.h6/.domain.json");
        assert!(is_domain_key(&key));
        assert_eq!(domain_from_key(&key).unwrap(), "/home/alice/sample.h6");
    }

    #[test]
    fn test_parent_domain() {
        assert_eq!(parent_domain("/home/alice/sample.h6").unwrap(), "/home/alice");
        assert_eq!(parent_domain("/home/alice").unwrap(), "/home");
        assert_eq!(parent_domain("/home"), None);
    }

    #[test]
    fn test_index_keys() {
        assert_eq!(domains_index_key(None), "topleveldomains.txt");
        assert_eq!(domains_index_key(Some("/home")), "home/.domains.txt");
        assert_eq!(
            collection_index_key("/home/alice/sample.h6", "datasets"),
            "home/alice/sample.h6/.datasets.txt"
        );
    }

    #[test]
    fn test_dns_form() {
        assert_eq!(dns_to_path("sample.alice.home"), "/home/alice/sample");
        assert_eq!(dns_to_path("/home/alice"), "/home/alice");
    }

    #[test]
    fn test_domain_from_request() {
        let req = Request::builder()
            .uri("http://sn1:5102/groups?domain=/home/alice/sample.h6")
            .body(Body::empty())
            .unwrap();
        assert_eq!(domain_from_request(&req).unwrap(), "/home/alice/sample.h6");

        let req = Request::builder()
            .uri("http://sn1:5102/")
            .header("Host", "sample.alice.home:5102")
            .body(Body::empty())
            .unwrap();
        assert_eq!(domain_from_request(&req).unwrap(), "/home/alice/sample");
    }
}
