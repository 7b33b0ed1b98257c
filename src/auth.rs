use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use shared::ErrorInfo;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::codes::ErrorResponse;

/// The authenticated caller, exposed to handlers via request extensions.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Principal {
    pub sub: String,
}

#[derive(Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies bearer tokens against the issuer's published key set. Only the
/// signature and standard claims are checked here; authorization stays out
/// of the registry.
#[derive(Clone)]
pub struct OidcAuthorizer {
    pub issuer: String,
    keys: Arc<Vec<VerifyKey>>,
}

struct VerifyKey {
    kid: Option<String>,
    key: DecodingKey,
    algorithm: Algorithm,
}

impl OidcAuthorizer {
    /// Fetch `<issuer>/.well-known/openid-configuration` and its key set.
    pub async fn discover(issuer: &str) -> Result<Self, ErrorInfo> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let discovery: DiscoveryDocument = reqwest::get(&discovery_url)
            .await
            .map_err(ErrorInfo::internal)?
            .json()
            .await
            .map_err(ErrorInfo::internal)?;
        let jwks: JwkSet = reqwest::get(&discovery.jwks_uri)
            .await
            .map_err(ErrorInfo::internal)?
            .json()
            .await
            .map_err(ErrorInfo::internal)?;

        let mut keys = Vec::new();
        for jwk in &jwks.keys {
            let Ok(key) = DecodingKey::from_jwk(jwk) else {
                continue;
            };
            let algorithm = jwk
                .common
                .key_algorithm
                .and_then(|a| Algorithm::from_str(&a.to_string()).ok())
                .unwrap_or(Algorithm::RS256);
            keys.push(VerifyKey {
                kid: jwk.common.key_id.clone(),
                key,
                algorithm,
            });
        }
        if keys.is_empty() {
            return Err(ErrorInfo::config_invalid(&format!(
                "no usable keys at {discovery_url}"
            )));
        }
        info!("oidc issuer {} provided {} keys", issuer, keys.len());
        Ok(Self {
            issuer: issuer.to_string(),
            keys: Arc::new(keys),
        })
    }

    pub fn verify(&self, token: &str) -> Result<Principal, ErrorInfo> {
        let header =
            decode_header(token).map_err(|e| ErrorInfo::unauthorized(&e.to_string()))?;
        for candidate in self.keys.iter() {
            if let (Some(kid), Some(expected)) = (&candidate.kid, &header.kid) {
                if kid != expected {
                    continue;
                }
            }
            let mut validation = Validation::new(candidate.algorithm);
            validation.validate_aud = false;
            if let Ok(data) = decode::<Claims>(token, &candidate.key, &validation) {
                return Ok(Principal {
                    sub: data.claims.sub,
                });
            }
        }
        Err(ErrorInfo::unauthorized("token verification failed"))
    }

    #[cfg(test)]
    fn from_keys(issuer: &str, keys: Vec<VerifyKey>) -> Self {
        Self {
            issuer: issuer.to_string(),
            keys: Arc::new(keys),
        }
    }
}

/// Wraps every route except `/healthz`. The token comes from the
/// Authorization header or, failing that, a `token`/`access_token` query
/// parameter.
pub async fn auth_middleware(
    State(authorizer): State<OidcAuthorizer>,
    mut req: Request,
    next: Next,
) -> Result<Response, ErrorResponse> {
    if req.uri().path() == "/healthz" {
        return Ok(next.run(req).await);
    }
    let Some(token) = bearer_token(&req) else {
        return Err(ErrorResponse(ErrorInfo::unauthorized("missing bearer token")));
    };
    let principal = authorizer.verify(&token).map_err(ErrorResponse::from)?;
    debug!("authenticated {}", principal.sub);
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

fn bearer_token(req: &Request) -> Option<String> {
    if let Some(header) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(token) = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
        {
            return Some(token.to_string());
        }
    }
    let query = req.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" || key == "access_token").then(|| value.to_string())
    })
}
