use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::{Deserialize, Serialize};

const KEYCHAIN_PREFIX: &str = "keychain:";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Resolves a configured secret. `keychain:<service>:<account>` is looked up in
/// the OS keychain; any other value is used as is.
pub fn resolve_secret(value: &str) -> Result<String> {
    let Some(reference) = value.strip_prefix(KEYCHAIN_PREFIX) else {
        return Ok(value.to_string());
    };
    let (service, account) = reference
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid keychain reference"))?;
    keyring::Entry::new(service, account)
        .map_err(|e| anyhow!("Keychain error: {}", e))?
        .get_password()
        .map_err(|e| anyhow!("Keychain fetch error: {}", e))
}

/// The fields of a Google service-account key file that the sink needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

pub struct AssertionSigner {
    client_email: String,
    token_uri: String,
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl AssertionSigner {
    pub fn new(key: &ServiceAccountKey) -> Result<Self> {
        let der = pem_to_der(&key.private_key)?;
        let key_pair =
            RsaKeyPair::from_pkcs8(&der).map_err(|e| anyhow!("Invalid service account key: {}", e))?;
        Ok(AssertionSigner {
            client_email: key.client_email.clone(),
            token_uri: key.token_uri.clone(),
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    pub fn token_uri(&self) -> &str {
        &self.token_uri
    }

    /// Signed RS256 JWT for the OAuth jwt-bearer grant.
    pub fn assertion(&self, scope: &str, issued_at: i64) -> Result<String> {
        let signing_input = signing_input(&self.client_email, &self.token_uri, scope, issued_at)?;
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, signing_input.as_bytes(), &mut signature)
            .map_err(|_| anyhow!("Signing failed"))?;
        Ok(format!(
            "{}.{}",
            signing_input,
            general_purpose::URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

fn signing_input(issuer: &str, audience: &str, scope: &str, issued_at: i64) -> Result<String> {
    let header = serde_json::to_vec(&JwtHeader {
        alg: "RS256",
        typ: "JWT",
    })?;
    let claims = serde_json::to_vec(&JwtClaims {
        iss: issuer,
        scope,
        aud: audience,
        iat: issued_at,
        exp: issued_at + TOKEN_LIFETIME_SECS,
    })?;
    Ok(format!(
        "{}.{}",
        general_purpose::URL_SAFE_NO_PAD.encode(header),
        general_purpose::URL_SAFE_NO_PAD.encode(claims)
    ))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(anyhow!("Empty private key"));
    }
    general_purpose::STANDARD
        .decode(body)
        .map_err(|e| anyhow!("Decode private key: {}", e))
}
