use callwire_core::{Credentials, Headers, AUTHORIZATION};

/// Supplies credentials for outgoing calls.
///
/// `request_headers` is attached to every request. `credentials` is asked
/// once per call when the server answers with a challenge for `realm`.
pub trait Authentication: Send + Sync {
    fn request_headers(&self) -> Headers {
        Headers::new()
    }

    fn credentials(&self, realm: &str) -> Option<Credentials>;
}

/// User/password authentication using the `Basic` scheme.
#[derive(Debug, Clone)]
pub struct BasicAuthentication {
    credentials: Credentials,
    preemptive: bool,
}

impl BasicAuthentication {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        BasicAuthentication {
            credentials: Credentials::new(user, password),
            preemptive: false,
        }
    }

    /// Send credentials with every request instead of waiting for a challenge.
    pub fn preemptive(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }
}

impl Authentication for BasicAuthentication {
    fn request_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if self.preemptive {
            headers.insert(AUTHORIZATION, self.credentials.to_header_value());
        }
        headers
    }

    fn credentials(&self, _realm: &str) -> Option<Credentials> {
        Some(self.credentials.clone())
    }
}
