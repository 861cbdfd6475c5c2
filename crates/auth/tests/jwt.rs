use std::time::Duration;

use amani_auth::{JwtConfig, JwtVerifier};
use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

const SECRET: &str = "test-secret-test-secret-test-secret";

fn verifier() -> JwtVerifier {
    JwtVerifier::new(JwtConfig {
        secret: SECRET.to_string(),
        audience: Some("amani".to_string()),
        clock_skew: Duration::from_secs(0),
        roles_claim: "roles".to_string(),
    })
    .expect("verifier init should succeed")
}

fn bearer_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token)
            .parse()
            .expect("authorization header must parse"),
    );
    headers
}

fn sign(claims: &serde_json::Value) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token encode should succeed")
}

#[test]
fn authenticate_extracts_user_and_roles_from_valid_token() {
    let token = sign(&serde_json::json!({
        "sub": "u-42",
        "aud": "amani",
        "exp": 2000000000u64,
        "iat": 1000000000u64,
        "roles": ["PROGRAM_MANAGER", "FIELD_OPERATOR"]
    }));

    let ctx = verifier()
        .authenticate(&bearer_headers(&token))
        .expect("authenticate should succeed");

    assert_eq!(ctx.user_id, "u-42");
    assert_eq!(
        ctx.roles,
        Some(vec![
            "PROGRAM_MANAGER".to_string(),
            "FIELD_OPERATOR".to_string()
        ])
    );
}

#[test]
fn missing_roles_claim_yields_none_for_directory_fallback() {
    let token = sign(&serde_json::json!({
        "sub": "u-7",
        "aud": "amani",
        "exp": 2000000000u64,
    }));

    let ctx = verifier()
        .authenticate(&bearer_headers(&token))
        .expect("authenticate should succeed");
    assert_eq!(ctx.roles, None);
}

#[test]
fn expired_token_is_rejected_as_invalid() {
    let token = sign(&serde_json::json!({
        "sub": "u-7",
        "aud": "amani",
        "exp": 1000000001u64,
    }));

    let err = verifier()
        .authenticate(&bearer_headers(&token))
        .expect_err("expired token must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[test]
fn wrong_audience_is_rejected() {
    let token = sign(&serde_json::json!({
        "sub": "u-7",
        "aud": "someone-else",
        "exp": 2000000000u64,
    }));

    let err = verifier()
        .authenticate(&bearer_headers(&token))
        .expect_err("wrong audience must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[test]
fn missing_header_is_reported_as_required() {
    let err = verifier()
        .authenticate(&HeaderMap::new())
        .expect_err("missing header must fail");
    assert_eq!(err.code, "ERR_AUTH_REQUIRED");
}

#[test]
fn non_array_roles_claim_is_rejected() {
    let token = sign(&serde_json::json!({
        "sub": "u-7",
        "aud": "amani",
        "exp": 2000000000u64,
        "roles": "SUPER_ADMIN"
    }));

    let err = verifier()
        .authenticate(&bearer_headers(&token))
        .expect_err("scalar roles claim must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}
