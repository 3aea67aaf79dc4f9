//! Typed token claims

use serde::Deserialize;

use crate::error::AuthError;

/// Claims the broker reads from a verified token
///
/// `sub`, `iat` and `exp` must be present for the token to decode at all.
/// The identity claims are optional here and required by the conversion
/// matching the caller's expected identity kind.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Authorized party: the client the token was issued to
    #[serde(default)]
    pub azp: Option<String>,
    /// Only present on client-credential grants
    #[serde(default)]
    pub client_id: Option<String>,
}

/// A human user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub subject: String,
    pub username: String,
}

/// A service client authenticated with client credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub subject: String,
    pub client_id: String,
}

/// Either kind of identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(UserIdentity),
    Service(ServiceIdentity),
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TokenClaims {
    pub fn into_user(self) -> Result<UserIdentity, AuthError> {
        if self.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub"));
        }
        let username =
            non_empty(self.preferred_username).ok_or(AuthError::MissingClaim("preferred_username"))?;
        Ok(UserIdentity {
            subject: self.sub,
            username,
        })
    }

    /// Service identity from `client_id`, falling back to `azp` when allowed
    pub fn into_service(self, allow_azp: bool) -> Result<ServiceIdentity, AuthError> {
        if self.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub"));
        }
        let client_id = match non_empty(self.client_id) {
            Some(id) => id,
            None if allow_azp => non_empty(self.azp).ok_or(AuthError::MissingClaim("client_id"))?,
            None => return Err(AuthError::MissingClaim("client_id")),
        };
        Ok(ServiceIdentity {
            subject: self.sub,
            client_id,
        })
    }

    /// The client the token was issued to, from either claim
    pub fn client(&self) -> Option<&str> {
        self.client_id
            .as_deref()
            .or(self.azp.as_deref())
            .filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(json: serde_json::Value) -> Result<TokenClaims, serde_json::Error> {
        serde_json::from_value(json)
    }

    #[test]
    fn test_required_fields_fail_closed() {
        assert!(claims(serde_json::json!({"sub": "u1", "exp": 10})).is_err());
        assert!(claims(serde_json::json!({"sub": "u1", "iat": 1})).is_err());
        assert!(claims(serde_json::json!({"iat": 1, "exp": 10})).is_err());
        assert!(claims(serde_json::json!({"sub": 5, "iat": 1, "exp": 10})).is_err());
    }

    #[test]
    fn test_user_identity_requires_username() {
        let c = claims(serde_json::json!({"sub": "u1", "iat": 1, "exp": 10})).unwrap();
        assert!(matches!(
            c.into_user(),
            Err(AuthError::MissingClaim("preferred_username"))
        ));

        let c = claims(serde_json::json!({
            "sub": "u1", "iat": 1, "exp": 10, "preferred_username": "alice"
        }))
        .unwrap();
        assert_eq!(c.into_user().unwrap().username, "alice");
    }

    #[test]
    fn test_service_identity() {
        let c = claims(serde_json::json!({
            "sub": "s1", "iat": 1, "exp": 10, "azp": "kuberde-agent"
        }))
        .unwrap();
        assert!(c.clone().into_service(false).is_err());
        assert_eq!(c.into_service(true).unwrap().client_id, "kuberde-agent");

        let c = claims(serde_json::json!({
            "sub": "s1", "iat": 1, "exp": 10, "client_id": "kuberde-agent", "azp": "other"
        }))
        .unwrap();
        assert_eq!(c.client(), Some("kuberde-agent"));
        assert_eq!(c.into_service(false).unwrap().client_id, "kuberde-agent");
    }
}
