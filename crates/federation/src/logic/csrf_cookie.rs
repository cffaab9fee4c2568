//! The CSRF cookie anchors the CSRF value to the user agent independently of
//! the `state` parameter.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use shared::error::CommonError;

use crate::logic::codec::SecureCodec;
use crate::logic::security_values::CsrfToken;

/// `__Host-` requires Secure, Path=/ and no Domain, which is what we issue.
pub const CSRF_COOKIE_NAME: &str = "__Host-fedgate-csrf";
pub const CSRF_COOKIE_ENCODING_NAME: &str = "csrf";

/// Returns the CSRF value from a valid cookie. Missing or undecodable cookies
/// (for example after a key rotation) read as absent so a fresh one is issued.
pub fn read_csrf_cookie(jar: &CookieJar, codec: &SecureCodec) -> Option<CsrfToken> {
    let cookie = jar.get(CSRF_COOKIE_NAME)?;
    match codec.decode::<CsrfToken>(CSRF_COOKIE_ENCODING_NAME, cookie.value()) {
        Ok(csrf) => Some(csrf),
        Err(e) => {
            tracing::debug!(error = %e, "ignoring undecodable CSRF cookie");
            None
        }
    }
}

pub fn csrf_cookie(csrf: &CsrfToken, codec: &SecureCodec) -> Result<Cookie<'static>, CommonError> {
    let encoded = codec
        .encode(CSRF_COOKIE_ENCODING_NAME, csrf)
        .map_err(|e| CommonError::internal("error encoding CSRF cookie", e))?;

    Ok(Cookie::build((CSRF_COOKIE_NAME, encoded))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build())
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::logic::codec::CodecKey;

    fn codec() -> SecureCodec {
        SecureCodec::new(vec![CodecKey::generate().unwrap()], None).unwrap()
    }

    #[test]
    fn test_issued_cookie_attributes() {
        let codec = codec();
        let cookie = csrf_cookie(&CsrfToken::new("csrf-value"), &codec).unwrap();

        assert_eq!(cookie.name(), CSRF_COOKIE_NAME);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.domain(), None);
    }

    #[test]
    fn test_read_issued_cookie() {
        let codec = codec();
        let cookie = csrf_cookie(&CsrfToken::new("csrf-value"), &codec).unwrap();
        let jar = CookieJar::new().add(cookie);

        assert_eq!(
            read_csrf_cookie(&jar, &codec),
            Some(CsrfToken::new("csrf-value"))
        );
    }

    #[test]
    fn test_missing_or_invalid_cookie_reads_as_absent() {
        let current = codec();
        assert_eq!(read_csrf_cookie(&CookieJar::new(), &current), None);

        let jar = CookieJar::new().add(Cookie::new(CSRF_COOKIE_NAME, "garbage"));
        assert_eq!(read_csrf_cookie(&jar, &current), None);

        // Signed by a key we no longer hold.
        let stale = csrf_cookie(&CsrfToken::new("old"), &codec()).unwrap();
        let jar = CookieJar::new().add(stale);
        assert_eq!(read_csrf_cookie(&jar, &current), None);
    }
}
