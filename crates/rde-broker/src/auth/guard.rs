//! Token verification and ownership checks

use std::str::FromStr;
use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use tracing::debug;

use rde_core::config::AuthConfig;
use rde_core::{AgentId, ConfigError, OwnershipLookup};

use super::claims::{Identity, ServiceIdentity, TokenClaims, UserIdentity};
use super::jwks::JwksCache;
use crate::error::AuthError;

/// Verifies bearer tokens and who may address which agent
pub struct AuthGuard {
    config: AuthConfig,
    algorithms: Vec<Algorithm>,
    jwks: Arc<JwksCache>,
    ownership: Arc<dyn OwnershipLookup>,
}

impl AuthGuard {
    pub fn new(
        config: AuthConfig,
        jwks: Arc<JwksCache>,
        ownership: Arc<dyn OwnershipLookup>,
    ) -> Result<Self, ConfigError> {
        let algorithms = config
            .algorithms
            .iter()
            .map(|name| {
                Algorithm::from_str(name)
                    .map_err(|_| ConfigError::Invalid(format!("unknown signing algorithm {:?}", name)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            algorithms,
            jwks,
            ownership,
        })
    }

    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    /// Verify signature, expiry, issuer and audience; decode typed claims
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed header: {}", e)))?;
        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let jwk = self.jwks.find(header.kid.as_deref())?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthError::InvalidToken(format!("unusable signing key: {}", e)))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.leeway.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        jsonwebtoken::decode::<TokenClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::MissingRequiredClaim(claim) => {
                    debug!("Token lacks required claim {}", claim);
                    AuthError::InvalidToken(format!("missing claim {}", claim))
                }
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }

    /// A user addressing `target`: the user must own the agent
    pub fn authorize(&self, token: &str, target: &str) -> Result<(AgentId, UserIdentity), AuthError> {
        let id = AgentId::parse(target)?;
        let user = self.verify(token)?.into_user()?;
        self.check_owner(&id, &user.username)?;
        Ok((id, user))
    }

    /// An agent connecting as `target` with a client-credentials token
    pub fn authorize_agent(
        &self,
        token: &str,
        target: &str,
    ) -> Result<(AgentId, ServiceIdentity), AuthError> {
        let id = AgentId::parse(target)?;
        let allow_listed = !self.config.agent_client_ids.is_empty();
        // Without an allow-list only a client-credential grant qualifies
        let service = self.verify(token)?.into_service(allow_listed)?;
        if allow_listed && !self.config.agent_client_ids.contains(&service.client_id) {
            return Err(AuthError::Forbidden(format!(
                "client {} may not connect agents",
                service.client_id
            )));
        }
        self.check_admitted(&id)?;
        Ok((id, service))
    }

    /// The management API: the owning user, or a listed service client
    pub fn authorize_management(&self, token: &str, target: &str) -> Result<(AgentId, Identity), AuthError> {
        let id = AgentId::parse(target)?;
        let claims = self.verify(token)?;

        let listed_client = claims
            .client()
            .filter(|client| self.config.management_client_ids.iter().any(|c| c == client))
            .is_some();
        if listed_client {
            let service = claims.into_service(true)?;
            return Ok((id, Identity::Service(service)));
        }

        let user = claims.into_user()?;
        self.check_owner(&id, &user.username)?;
        Ok((id, Identity::User(user)))
    }

    /// The recorded owner must match both the identifier and the claim
    fn check_owner(&self, id: &AgentId, claimed: &str) -> Result<(), AuthError> {
        match self.ownership.owner_of(id) {
            Some(owner) if owner == id.owner() && owner == claimed => Ok(()),
            Some(owner) if owner != id.owner() => Err(AuthError::Forbidden(format!(
                "ownership record for {} disagrees with its identifier",
                id
            ))),
            Some(_) => Err(AuthError::Forbidden(format!("{} does not own {}", claimed, id))),
            None => Err(AuthError::Forbidden(format!("{} is not an admitted agent", id))),
        }
    }

    fn check_admitted(&self, id: &AgentId) -> Result<(), AuthError> {
        let owner = self.ownership.owner_of(id);
        self.check_owner(id, owner.as_deref().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::jwk::JwkSet;
    use jsonwebtoken::{EncodingKey, Header};
    use rde_core::{IdentifierOwnership, StaticOwners};
    use std::collections::HashMap;

    const SECRET: &[u8] = b"kuberde-unit-test-signing-secret-012";
    // base64 of SECRET (no padding needed at this length)
    const SECRET_B64: &str = "a3ViZXJkZS11bml0LXRlc3Qtc2lnbmluZy1zZWNyZXQtMDEy";

    fn jwks() -> Arc<JwksCache> {
        let set: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [{"kty": "oct", "kid": "unit", "alg": "HS256", "k": SECRET_B64}]
        }))
        .unwrap();
        Arc::new(JwksCache::with_keys(set))
    }

    fn config() -> AuthConfig {
        AuthConfig {
            jwks_url: "http://unused".into(),
            algorithms: vec!["HS256".into()],
            issuer: Some("https://sso.test/realms/kuberde".into()),
            management_client_ids: vec!["kuberde-operator".into()],
            ..AuthConfig::default()
        }
    }

    fn guard_with(config: AuthConfig, ownership: Arc<dyn OwnershipLookup>) -> AuthGuard {
        AuthGuard::new(config, jwks(), ownership).unwrap()
    }

    fn guard() -> AuthGuard {
        guard_with(config(), Arc::new(IdentifierOwnership))
    }

    fn sign(claims: serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("unit".into());
        jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn user_token(username: &str) -> String {
        sign(serde_json::json!({
            "sub": format!("sub-{}", username),
            "iat": now(),
            "exp": now() + 300,
            "iss": "https://sso.test/realms/kuberde",
            "preferred_username": username,
            "azp": "kuberde-cli",
        }))
    }

    fn service_token(client_id: &str) -> String {
        sign(serde_json::json!({
            "sub": format!("service-account-{}", client_id),
            "iat": now(),
            "exp": now() + 300,
            "iss": "https://sso.test/realms/kuberde",
            "client_id": client_id,
            "azp": client_id,
        }))
    }

    #[test]
    fn test_owner_is_accepted_and_others_rejected() {
        let guard = guard();
        let token = user_token("alice");

        let (id, user) = guard.authorize(&token, "user-alice-dev-1").unwrap();
        assert_eq!(id.as_str(), "user-alice-dev-1");
        assert_eq!(user.username, "alice");

        assert!(matches!(
            guard.authorize(&token, "user-bob-dev-1"),
            Err(AuthError::Forbidden(_))
        ));
    }

    #[test]
    fn test_malformed_identifier_fails_closed() {
        let guard = guard();
        let token = user_token("alice");
        assert!(matches!(
            guard.authorize(&token, "alice-dev"),
            Err(AuthError::InvalidAgentId(_))
        ));
        assert!(matches!(
            guard.authorize(&token, "user-alice"),
            Err(AuthError::InvalidAgentId(_))
        ));
    }

    #[test]
    fn test_expired_token() {
        let guard = guard();
        let token = sign(serde_json::json!({
            "sub": "s", "iat": now() - 7200, "exp": now() - 3600,
            "iss": "https://sso.test/realms/kuberde", "preferred_username": "alice",
        }));
        assert!(matches!(guard.authorize(&token, "user-alice-dev"), Err(AuthError::Expired)));
    }

    #[test]
    fn test_bad_signature_and_issuer() {
        let guard = guard();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("unit".into());
        let forged = jsonwebtoken::encode(
            &header,
            &serde_json::json!({"sub": "s", "iat": now(), "exp": now() + 60, "preferred_username": "alice"}),
            &EncodingKey::from_secret(b"not-the-secret"),
        )
        .unwrap();
        assert!(matches!(guard.verify(&forged), Err(AuthError::InvalidToken(_))));

        let wrong_issuer = sign(serde_json::json!({
            "sub": "s", "iat": now(), "exp": now() + 60,
            "iss": "https://evil.test", "preferred_username": "alice",
        }));
        assert!(matches!(guard.verify(&wrong_issuer), Err(AuthError::InvalidToken(_))));

        assert!(matches!(guard.verify("not.a.jwt"), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_missing_identity_claims_fail_closed() {
        let guard = guard();
        let no_username = sign(serde_json::json!({
            "sub": "s", "iat": now(), "exp": now() + 60, "iss": "https://sso.test/realms/kuberde",
        }));
        assert!(matches!(
            guard.authorize(&no_username, "user-alice-dev"),
            Err(AuthError::MissingClaim("preferred_username"))
        ));

        let no_iat = sign(serde_json::json!({
            "sub": "s", "exp": now() + 60, "iss": "https://sso.test/realms/kuberde",
            "preferred_username": "alice",
        }));
        assert!(matches!(guard.verify(&no_iat), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_algorithm_allow_list() {
        let guard = guard_with(
            AuthConfig {
                algorithms: vec!["RS256".into()],
                ..config()
            },
            Arc::new(IdentifierOwnership),
        );
        assert!(matches!(
            guard.verify(&user_token("alice")),
            Err(AuthError::InvalidToken(_))
        ));
        assert!(AuthGuard::new(
            AuthConfig {
                algorithms: vec!["ROT13".into()],
                ..config()
            },
            jwks(),
            Arc::new(IdentifierOwnership)
        )
        .is_err());
    }

    #[test]
    fn test_agent_requires_client_credentials() {
        let guard = guard();
        let (id, service) = guard
            .authorize_agent(&service_token("kuberde-agent"), "user-alice-dev")
            .unwrap();
        assert_eq!(id.owner(), "alice");
        assert_eq!(service.client_id, "kuberde-agent");

        // A user token carries azp but no client_id
        assert!(guard
            .authorize_agent(&user_token("alice"), "user-alice-dev")
            .is_err());
    }

    #[test]
    fn test_agent_client_allow_list() {
        let guard = guard_with(
            AuthConfig {
                agent_client_ids: vec!["kuberde-agent".into()],
                ..config()
            },
            Arc::new(IdentifierOwnership),
        );
        assert!(guard
            .authorize_agent(&service_token("kuberde-agent"), "user-alice-dev")
            .is_ok());
        assert!(matches!(
            guard.authorize_agent(&service_token("intruder"), "user-alice-dev"),
            Err(AuthError::Forbidden(_))
        ));
    }

    #[test]
    fn test_static_owners_fail_closed() {
        let owners = StaticOwners::new(HashMap::from([
            ("user-alice-dev".to_string(), "alice".to_string()),
            // Disagrees with the identifier's owner segment
            ("user-alice-tampered".to_string(), "mallory".to_string()),
        ]));
        let guard = guard_with(config(), Arc::new(owners));

        assert!(guard.authorize(&user_token("alice"), "user-alice-dev").is_ok());
        assert!(guard.authorize(&user_token("alice"), "user-alice-unknown").is_err());
        assert!(guard.authorize(&user_token("alice"), "user-alice-tampered").is_err());
        assert!(guard.authorize(&user_token("mallory"), "user-alice-tampered").is_err());

        assert!(guard
            .authorize_agent(&service_token("kuberde-agent"), "user-alice-dev")
            .is_ok());
        assert!(guard
            .authorize_agent(&service_token("kuberde-agent"), "user-alice-unknown")
            .is_err());
    }

    #[test]
    fn test_management_access() {
        let guard = guard();
        let (_, identity) = guard
            .authorize_management(&service_token("kuberde-operator"), "user-bob-dev")
            .unwrap();
        assert!(matches!(identity, Identity::Service(_)));

        let (_, identity) = guard
            .authorize_management(&user_token("bob"), "user-bob-dev")
            .unwrap();
        assert!(matches!(identity, Identity::User(_)));

        assert!(guard
            .authorize_management(&user_token("alice"), "user-bob-dev")
            .is_err());
        assert!(guard
            .authorize_management(&service_token("kuberde-agent"), "user-bob-dev")
            .is_err());
    }
}
