//! Session model — the owner of publish engines and subscriptions.
//!
//! Authentication happens elsewhere; this crate only needs a session's id
//! and its identity snapshot for the transfer compatibility rule.

use crate::publish::PublishEngine;
use crate::transfer::SessionIdentity;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Unique session identifier, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A client session with its publish engine.
pub struct Session {
    id: SessionId,
    identity: SessionIdentity,
    engine: PublishEngine,
}

impl Session {
    /// Creates a session around an already configured engine.
    #[must_use]
    pub fn new(id: SessionId, identity: SessionIdentity, engine: PublishEngine) -> Self {
        Self {
            id,
            identity,
            engine,
        }
    }

    /// Returns the session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the identity the session authenticated with.
    #[must_use]
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Shared access to the session's publish engine.
    #[must_use]
    pub fn engine(&self) -> &PublishEngine {
        &self.engine
    }

    /// Mutable access to the session's publish engine.
    pub fn engine_mut(&mut self) -> &mut PublishEngine {
        &mut self.engine
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::RetentionPolicy;
    use crate::transfer::IdentityToken;

    #[test]
    fn test_session_accessors() {
        let engine = PublishEngine::for_session(SessionId(3), RetentionPolicy::RetainForTransfer, 4);
        let session = Session::new(
            SessionId(3),
            Some(IdentityToken::Anonymous),
            engine,
        );
        assert_eq!(session.id(), SessionId(3));
        assert_eq!(session.identity(), &Some(IdentityToken::Anonymous));
        assert_eq!(session.engine().session(), Some(SessionId(3)));
        assert_eq!(format!("{}", session.id()), "session-3");
    }
}
