use callwire_core::{Credentials, Headers, AUTHORIZATION};
use tracing::debug;

/// Decides whether a request may be served.
///
/// Requests that fail [`authenticate`](Authenticator::authenticate) are
/// answered with an authentication challenge naming [`realm`](Authenticator::realm).
pub trait Authenticator: Send + Sync {
    fn realm(&self) -> &str;

    fn authenticate(&self, headers: &Headers) -> bool;
}

/// Accepts requests carrying one fixed user/password pair.
#[derive(Debug, Clone)]
pub struct BasicAuthenticator {
    realm: String,
    credentials: Credentials,
}

impl BasicAuthenticator {
    pub fn new(realm: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            realm: realm.into(),
            credentials,
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn realm(&self) -> &str {
        &self.realm
    }

    fn authenticate(&self, headers: &Headers) -> bool {
        let Some(value) = headers.get_str(AUTHORIZATION) else {
            return false;
        };
        match Credentials::from_header_value(value) {
            Ok(presented) => presented == self.credentials,
            Err(e) => {
                debug!(error = %e, "Rejecting malformed authorization header");
                false
            }
        }
    }
}
