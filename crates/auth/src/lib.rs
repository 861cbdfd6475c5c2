use std::time::Duration;

use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};

/// The authenticated caller as established from the bearer token. `roles`
/// carries the token's role claim when the issuer attached one; `None`
/// (or an empty list) means the role set must be resolved from the
/// directory instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn required(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_AUTH_REQUIRED",
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_AUTH_INVALID",
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub audience: Option<String>,
    pub clock_skew: Duration,
    pub roles_claim: String,
}

/// Verifies bearer tokens minted by the account subsystem (HS256, shared
/// secret). Token issuance lives outside this service.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    roles_claim: String,
}

impl JwtVerifier {
    pub fn new(config: JwtConfig) -> Result<Self, AuthError> {
        if config.secret.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "jwt secret must be non-empty".to_string(),
            });
        }
        if config.roles_claim.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "jwt roles_claim must be non-empty".to_string(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.clock_skew.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);
        match config.audience.as_deref() {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            roles_claim: config.roles_claim,
        })
    }

    /// Authenticate the request from its `Authorization: Bearer` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let token = bearer_token(headers)?;

        let data = decode::<serde_json::Value>(token, &self.decoding_key, &self.validation)
            .map_err(|err| AuthError::invalid(format!("token rejected: {}", err)))?;

        let user_id = data
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AuthError::invalid("token missing sub claim"))?
            .to_string();

        let roles = match data.claims.get(self.roles_claim.as_str()) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Array(values)) => {
                let mut names = Vec::with_capacity(values.len());
                for value in values {
                    let name = value
                        .as_str()
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .ok_or_else(|| {
                            AuthError::invalid(format!(
                                "token claim `{}` must be a string array",
                                self.roles_claim
                            ))
                        })?;
                    names.push(name.to_string());
                }
                Some(names)
            }
            Some(_) => {
                return Err(AuthError::invalid(format!(
                    "token claim `{}` must be a string array",
                    self.roles_claim
                )));
            }
        };

        Ok(AuthContext { user_id, roles })
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AuthError::required("missing authorization header"))?
        .to_str()
        .map_err(|_| AuthError::invalid("authorization header is not valid ascii"))?
        .trim();

    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::invalid("authorization header must be a bearer token"))?;

    Ok(token)
}
