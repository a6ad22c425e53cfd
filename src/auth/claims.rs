//! Claims carried by a bearer token issued by the external Auth service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims this service trusts. Auth issues the token; we only verify it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the authenticated user's id.
    pub sub: Uuid,
    pub exp: usize,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    pub fn user_id(&self) -> Uuid {
        self.sub
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_detected() {
        let claims = Claims {
            sub: Uuid::new_v4(),
            exp: 0,
            roles: vec!["admin".to_string()],
        };
        assert!(claims.is_admin());
    }

    #[test]
    fn non_admin_role_not_detected() {
        let claims = Claims {
            sub: Uuid::new_v4(),
            exp: 0,
            roles: vec!["player".to_string()],
        };
        assert!(!claims.is_admin());
    }
}
