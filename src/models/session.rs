use std::fmt;

/// Authenticated identity a session is bound to.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub id_token: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            id_token: id_token.into(),
        }
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("user_id", &self.user_id)
            .field("id_token", &"[REDACTED]")
            .finish()
    }
}
