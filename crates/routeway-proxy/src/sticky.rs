//! Sticky sessions
//!
//! Backends establish a session with `JSESSIONID`. The proxy pins the client
//! to the serving endpoint with a second cookie holding the endpoint's
//! private instance id, and prefers that endpoint on later requests carrying
//! both cookies.

use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use routeway_router::Endpoint;

pub const SESSION_COOKIE: &str = "JSESSIONID";
pub const INSTANCE_COOKIE: &str = "__ROUTEWAY_INSTANCE__";

fn request_cookies(headers: &HeaderMap) -> impl Iterator<Item = (&str, &str)> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim(), value.trim().trim_matches('"')))
        })
}

/// Instance the client is pinned to; requires the session cookie as well
pub fn sticky_instance(headers: &HeaderMap) -> Option<String> {
    let mut has_session = false;
    let mut instance = None;

    for (name, value) in request_cookies(headers) {
        if name == SESSION_COOKIE {
            has_session = true;
        } else if name == INSTANCE_COOKIE && !value.is_empty() {
            instance = Some(value.to_string());
        }
    }

    if has_session {
        instance
    } else {
        None
    }
}

/// Attributes of a `Set-Cookie` for the session cookie
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SessionCookie {
    secure: bool,
    max_age: Option<i64>,
}

fn session_cookie(headers: &HeaderMap) -> Option<SessionCookie> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            let mut parts = value.split(';');
            let (name, _) = parts.next()?.trim().split_once('=')?;
            if name.trim() != SESSION_COOKIE {
                return None;
            }

            let mut cookie = SessionCookie::default();
            for attribute in parts {
                let attribute = attribute.trim();
                let (key, value) = attribute.split_once('=').unwrap_or((attribute, ""));
                if key.eq_ignore_ascii_case("secure") {
                    cookie.secure = true;
                } else if key.eq_ignore_ascii_case("max-age") {
                    cookie.max_age = value.trim().parse().ok();
                }
            }
            Some(cookie)
        })
}

/// Append the instance cookie when the backend opened a session in this
/// response, or when the request was pinned to a different endpoint than the
/// one that served it.
pub fn setup_sticky_session(
    response_headers: &mut HeaderMap,
    endpoint: &Endpoint,
    requested_instance: Option<&str>,
    context_path: &str,
    secure_cookies: bool,
) {
    if endpoint.private_instance_id.is_empty() {
        return;
    }

    let moved = requested_instance.is_some_and(|id| id != endpoint.private_instance_id);
    let session = session_cookie(response_headers);
    if session.is_none() && !moved {
        return;
    }

    let session = session.unwrap_or_default();
    let mut cookie = format!(
        "{}={}; Path={}",
        INSTANCE_COOKIE, endpoint.private_instance_id, context_path
    );
    // A session cookie being expired expires the pin with it
    if session.max_age.is_some_and(|age| age <= 0) {
        cookie.push_str("; Max-Age=0");
    }
    cookie.push_str("; HttpOnly");
    if session.secure || secure_cookies {
        cookie.push_str("; Secure");
    }

    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response_headers.append(SET_COOKIE, value);
    }
}
