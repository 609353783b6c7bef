use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Credential context for one signed-in operator.
///
/// Created on successful login and handed explicitly to every component that
/// talks to the backend. Ending the session is done by dropping it through
/// [`Session::logout`]; nothing keeps a process-wide copy.
#[derive(Clone)]
pub struct Session {
    token: String,
    user: Option<User>,
}

impl Session {
    pub fn login(token: impl Into<String>, user: Option<User>) -> Self {
        Session {
            token: token.into(),
            user,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn logout(self) -> Option<User> {
        self.user
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}
