//! Auth boundary: we verify bearer tokens issued by the external Auth
//! service. We never issue tokens, store passwords, or own user identity.

pub mod claims;
pub mod middleware;
pub mod verifier;

pub use claims::Claims;
pub use middleware::{auth_middleware, require_admin};
pub use verifier::AuthVerifier;
