//! Client hello verification: bearer JWT, protocol version and capability
//! negotiation.

use clinic_core::ids::{ConnectionId, UserId};
use clinic_core::payloads::HelloPayload;
use clinic_settings::{AuthSettings, ProtocolSettings};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::client::AuthInfo;

/// Handshake failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token and anonymous access is disabled.
    #[error("missing bearer token")]
    MissingToken,
    /// Token past its `exp`.
    #[error("token expired")]
    Expired,
    /// Bad signature, wrong issuer, malformed token.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Client asked for a protocol version this server does not speak.
    #[error("unsupported protocol version {requested}, supported: {supported:?}")]
    UnsupportedVersion {
        /// Requested version.
        requested: String,
        /// Versions this server speaks.
        supported: Vec<String>,
    },
}

/// Claims read from the bearer token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Capabilities the user is entitled to. Absent means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// Verifies client hellos.
pub struct Authenticator {
    secret: SecretString,
    validation: Validation,
    allow_anonymous: bool,
}

impl Authenticator {
    /// HS256 verifier with the given secret and optional issuer.
    pub fn new(secret: SecretString, issuer: Option<&str>, allow_anonymous: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match issuer {
            Some(iss) => {
                validation.set_required_spec_claims(&["exp", "sub", "iss"]);
                validation.set_issuer(&[iss]);
            }
            None => validation.set_required_spec_claims(&["exp", "sub"]),
        }
        Self {
            secret,
            validation,
            allow_anonymous,
        }
    }

    /// Build from settings.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            settings.jwt_secret.clone(),
            settings.jwt_issuer.as_deref(),
            settings.allow_anonymous,
        )
    }

    /// Verify a token. A leading `Bearer ` is stripped.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        decode::<Claims>(token, &key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }

    /// Run the full hello check for `connection_id`.
    pub fn handshake(
        &self,
        connection_id: &ConnectionId,
        hello: &HelloPayload,
        protocol: &ProtocolSettings,
    ) -> Result<AuthInfo, AuthError> {
        let version = negotiate_version(hello.version.as_deref(), protocol)?;
        let (user_id, entitled) = match hello.token.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(token) => {
                let claims = self.verify(token)?;
                (UserId::from(claims.sub), claims.capabilities)
            }
            None if self.allow_anonymous => {
                let suffix = connection_id.strip_prefix("conn_").unwrap_or(connection_id.as_str());
                (UserId::from(format!("anon-{suffix}")), None)
            }
            None => return Err(AuthError::MissingToken),
        };
        let capabilities = negotiate_capabilities(&hello.capabilities, &protocol.capabilities, entitled.as_deref());
        Ok(AuthInfo {
            user_id,
            capabilities,
            version,
        })
    }
}

/// Pick the protocol version. No request means the server's version.
pub fn negotiate_version(requested: Option<&str>, protocol: &ProtocolSettings) -> Result<String, AuthError> {
    match requested {
        None => Ok(protocol.version.clone()),
        Some(v) if protocol.supported_versions.iter().any(|s| s == v) => Ok(v.to_owned()),
        Some(v) => Err(AuthError::UnsupportedVersion {
            requested: v.to_owned(),
            supported: protocol.supported_versions.clone(),
        }),
    }
}

/// Capabilities both sides support, restricted to what the token grants.
///
/// A client that asks for nothing gets every server capability.
pub fn negotiate_capabilities(requested: &[String], server: &[String], entitled: Option<&[String]>) -> Vec<String> {
    server
        .iter()
        .filter(|c| requested.is_empty() || requested.contains(c))
        .filter(|c| entitled.is_none_or(|e| e.contains(c)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, exp_offset: i64, secret: &str) -> String {
        let exp = u64::try_from(chrono::Utc::now().timestamp() + exp_offset).unwrap();
        let claims = Claims {
            sub: sub.into(),
            exp,
            iss: None,
            capabilities: None,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn auth(anon: bool) -> Authenticator {
        Authenticator::new(SecretString::new(SECRET.into()), None, anon)
    }

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn valid_token_verifies() {
        let claims = auth(false).verify(&token("dr-ana", 600, SECRET)).unwrap();
        assert_eq!(claims.sub, "dr-ana");
    }

    #[test]
    fn bearer_prefix_is_tolerated() {
        let t = format!("Bearer {}", token("dr-ana", 600, SECRET));
        assert!(auth(false).verify(&t).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let err = auth(false).verify(&token("dr-ana", 600, "other")).unwrap_err();
        assert_matches!(err, AuthError::InvalidToken(_));
    }

    #[test]
    fn expired_token_is_rejected() {
        let err = auth(false).verify(&token("dr-ana", -3600, SECRET)).unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert_matches!(auth(false).verify("not.a.jwt"), Err(AuthError::InvalidToken(_)));
    }

    #[test]
    fn issuer_is_enforced_when_configured() {
        let a = Authenticator::new(SecretString::new(SECRET.into()), Some("clinic"), false);
        assert_matches!(a.verify(&token("u", 600, SECRET)), Err(AuthError::InvalidToken(_)));
    }

    #[test]
    fn missing_token_without_anonymous_fails() {
        let protocol = ProtocolSettings::default();
        let err = auth(false)
            .handshake(&ConnectionId::from("conn_1"), &HelloPayload::default(), &protocol)
            .unwrap_err();
        assert_eq!(err, AuthError::MissingToken);
    }

    #[test]
    fn anonymous_user_is_derived_from_connection() {
        let protocol = ProtocolSettings::default();
        let info = auth(true)
            .handshake(&ConnectionId::from("conn_abc"), &HelloPayload::default(), &protocol)
            .unwrap();
        assert_eq!(info.user_id.as_str(), "anon-abc");
        assert_eq!(info.version, protocol.version);
        assert_eq!(info.capabilities, protocol.capabilities);
    }

    #[test]
    fn unsupported_version_is_reported() {
        let protocol = ProtocolSettings::default();
        let hello = HelloPayload {
            version: Some("9.9.9".into()),
            ..HelloPayload::default()
        };
        assert_matches!(
            auth(true).handshake(&ConnectionId::from("conn_1"), &hello, &protocol),
            Err(AuthError::UnsupportedVersion { .. })
        );
    }

    #[test]
    fn capabilities_intersect() {
        let server = caps(&["query", "streaming", "feedback"]);
        assert_eq!(negotiate_capabilities(&[], &server, None), server);
        assert_eq!(
            negotiate_capabilities(&caps(&["streaming", "telepathy"]), &server, None),
            caps(&["streaming"])
        );
        assert_eq!(
            negotiate_capabilities(&[], &server, Some(&caps(&["query"]))),
            caps(&["query"])
        );
    }
}
