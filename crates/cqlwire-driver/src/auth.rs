//! Authentication providers
//!
//! Protocol v1 authenticates with a single CREDENTIALS map. Protocol v2 runs
//! a SASL exchange driven by an [`Authenticator`] created per connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

/// Source of credentials for new connections
pub trait AuthProvider: Send + Sync {
    /// CREDENTIALS map for protocol v1
    fn credentials(&self, host: SocketAddr) -> HashMap<String, String>;

    /// SASL authenticator for protocol v2. `authenticator` is the class name
    /// the server sent in AUTHENTICATE.
    fn new_authenticator(&self, host: SocketAddr, authenticator: &str) -> Box<dyn Authenticator>;
}

/// One SASL conversation
pub trait Authenticator: Send {
    fn initial_response(&mut self) -> Bytes;

    /// Answer a server challenge. An error aborts the handshake.
    fn evaluate_challenge(&mut self, challenge: Option<Bytes>) -> Result<Bytes, String>;

    fn on_success(&mut self, _token: Option<Bytes>) {}
}

/// Username/password authentication
#[derive(Clone)]
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PlainTextAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTextAuthProvider")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn credentials(&self, _host: SocketAddr) -> HashMap<String, String> {
        HashMap::from([
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.clone()),
        ])
    }

    fn new_authenticator(&self, _host: SocketAddr, _authenticator: &str) -> Box<dyn Authenticator> {
        Box::new(PlainTextAuthenticator {
            token: plain_token(&self.username, &self.password),
        })
    }
}

struct PlainTextAuthenticator {
    token: Bytes,
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&mut self) -> Bytes {
        self.token.clone()
    }

    fn evaluate_challenge(&mut self, _challenge: Option<Bytes>) -> Result<Bytes, String> {
        Ok(self.token.clone())
    }
}

/// SASL PLAIN token: `\0username\0password`
fn plain_token(username: &str, password: &str) -> Bytes {
    let mut token = BytesMut::with_capacity(username.len() + password.len() + 2);
    token.put_u8(0);
    token.put_slice(username.as_bytes());
    token.put_u8(0);
    token.put_slice(password.as_bytes());
    token.freeze()
}
