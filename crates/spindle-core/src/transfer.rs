//! Transfer compatibility — may a subscription move between sessions?
//!
//! The check itself is a pure predicate over the two sessions' identities; it
//! never assigns a service status. The call site maps an incompatible pair to
//! `BadUserAccessDenied`. The only error raised here is a wholly unsupported
//! token kind, which is a capability gap rather than an access decision.

use bytes::Bytes;

// ---------------------------------------------------------------------------
// IdentityToken
// ---------------------------------------------------------------------------

/// Identity a session authenticated with.
///
/// Only *equality* of identities matters in this crate; validating the
/// tokens themselves is the session layer's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityToken {
    /// No credentials presented.
    Anonymous,
    /// Username/password credentials; only the username participates in
    /// equality.
    UserName {
        /// The authenticated username.
        user: String,
    },
    /// X.509 certificate credentials.
    Certificate {
        /// DER bytes of the certificate.
        data: Bytes,
    },
    /// Externally issued token; not supported for transfer decisions.
    IssuedToken {
        /// Opaque token bytes.
        data: Bytes,
    },
}

/// The identity of a session; `None` when the session carries no identity
/// token at all.
pub type SessionIdentity = Option<IdentityToken>;

// ---------------------------------------------------------------------------
// TransferError
// ---------------------------------------------------------------------------

/// Errors raised by the compatibility check.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    /// A token kind this server cannot compare.
    #[error("unsupported identity token kind: {0}")]
    UnsupportedTokenKind(&'static str),
}

// ---------------------------------------------------------------------------
// compatible
// ---------------------------------------------------------------------------

/// Decides whether a subscription owned by `source` may be transferred to
/// `dest`.
///
/// `source` is `None` for a subscription that has never been owned by any
/// session — always compatible. Otherwise:
/// - neither side carries an identity token ⇒ compatible,
/// - anonymous ↔ anonymous ⇒ compatible,
/// - username ⇒ compatible iff both are usernames and equal,
/// - certificate ⇒ compatible iff both are certificates with byte-identical
///   data,
/// - any other pairing ⇒ incompatible.
///
/// # Errors
///
/// [`TransferError::UnsupportedTokenKind`] when either side presents an
/// issued token.
pub fn compatible(
    source: Option<&SessionIdentity>,
    dest: &SessionIdentity,
) -> Result<bool, TransferError> {
    let Some(source) = source else {
        return Ok(true);
    };

    if matches!(source, Some(IdentityToken::IssuedToken { .. }))
        || matches!(dest, Some(IdentityToken::IssuedToken { .. }))
    {
        return Err(TransferError::UnsupportedTokenKind("issued token"));
    }

    Ok(match (source, dest) {
        (None, None) => true,
        (Some(IdentityToken::Anonymous), Some(IdentityToken::Anonymous)) => true,
        (Some(IdentityToken::UserName { user: a }), Some(IdentityToken::UserName { user: b })) => {
            a == b
        }
        (
            Some(IdentityToken::Certificate { data: a }),
            Some(IdentityToken::Certificate { data: b }),
        ) => a == b,
        _ => false,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> SessionIdentity {
        Some(IdentityToken::UserName {
            user: name.to_owned(),
        })
    }

    fn cert(data: &'static [u8]) -> SessionIdentity {
        Some(IdentityToken::Certificate {
            data: Bytes::from_static(data),
        })
    }

    #[test]
    fn test_transfer_no_source_session_always_compatible() {
        assert!(compatible(None, &None).unwrap());
        assert!(compatible(None, &user("alice")).unwrap());
        assert!(compatible(None, &cert(b"abc")).unwrap());
        assert!(compatible(None, &Some(IdentityToken::Anonymous)).unwrap());
    }

    #[test]
    fn test_transfer_no_identity_both_sides() {
        assert!(compatible(Some(&None), &None).unwrap());
        assert!(!compatible(Some(&None), &user("alice")).unwrap());
        assert!(!compatible(Some(&user("alice")), &None).unwrap());
    }

    #[test]
    fn test_transfer_anonymous_pairing() {
        let anon = Some(IdentityToken::Anonymous);
        assert!(compatible(Some(&anon), &anon.clone()).unwrap());
        assert!(!compatible(Some(&anon), &user("alice")).unwrap());
    }

    #[test]
    fn test_transfer_username_equality() {
        assert!(compatible(Some(&user("alice")), &user("alice")).unwrap());
        assert!(!compatible(Some(&user("alice")), &user("bob")).unwrap());
    }

    #[test]
    fn test_transfer_username_vs_certificate() {
        assert!(!compatible(Some(&user("alice")), &cert(b"abc")).unwrap());
        assert!(!compatible(Some(&cert(b"abc")), &user("alice")).unwrap());
    }

    #[test]
    fn test_transfer_certificate_byte_equality() {
        assert!(compatible(Some(&cert(b"abc")), &cert(b"abc")).unwrap());
        assert!(!compatible(Some(&cert(b"abc")), &cert(b"abd")).unwrap());
    }

    #[test]
    fn test_transfer_issued_token_unsupported() {
        let issued = Some(IdentityToken::IssuedToken {
            data: Bytes::from_static(b"jwt"),
        });
        assert_eq!(
            compatible(Some(&issued), &user("alice")).unwrap_err(),
            TransferError::UnsupportedTokenKind("issued token")
        );
        assert_eq!(
            compatible(Some(&user("alice")), &issued).unwrap_err(),
            TransferError::UnsupportedTokenKind("issued token")
        );
        // Absent source still short-circuits before the kind check.
        assert!(compatible(None, &issued).unwrap());
    }
}
