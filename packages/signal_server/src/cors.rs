//! Origin allow-listing and CORS configuration.
//!
//! The allow-list comes from the `ALLOWED_ORIGINS` environment variable: a
//! comma-separated list of origins, read once at startup, entries trimmed.
//! The single entry `"*"` (the default when unset) allows any origin. The
//! same list drives both the CORS middleware and the upgrade-endpoint origin
//! gate, and the registry is never consulted for either.

use std::sync::LazyLock;

use actix_cors::Cors;
use actix_web::http;
use pairlink_env_utils::default_env;

static ALLOWED_ORIGINS: LazyLock<Vec<String>> =
    LazyLock::new(|| parse_origins(&default_env("ALLOWED_ORIGINS", "*")));

pub fn allowed_origins() -> &'static [String] {
    &ALLOWED_ORIGINS
}

fn parse_origins(value: &str) -> Vec<String> {
    let origins = value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    if origins.is_empty() {
        vec!["*".to_string()]
    } else {
        origins
    }
}

/// Whether `origin` passes the allow-list.
///
/// Matching is case-insensitive. A request without an `Origin` header (empty
/// `origin`) passes only when the allow-list contains the wildcard.
pub fn origin_allowed(origins: &[String], origin: &str) -> bool {
    origins
        .iter()
        .any(|allowed| allowed.as_str() == "*" || allowed.eq_ignore_ascii_case(origin))
}

/// Build the CORS middleware for the HTTP surface.
///
/// Allowed origins are echoed back per request; preflights advertise the
/// methods and headers the original service exposed.
pub fn middleware() -> Cors {
    Cors::default()
        .allowed_origin_fn(|origin, _req_head| {
            origin
                .to_str()
                .is_ok_and(|origin| origin_allowed(allowed_origins(), origin))
        })
        .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            http::header::CONTENT_TYPE,
            http::header::AUTHORIZATION,
        ])
        .supports_credentials()
        .max_age(3600)
}
