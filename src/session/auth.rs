//! Session authentication: JWT bearer tokens and certificate material.

use std::path::{Path, PathBuf};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TransportError};

/// Claims carried on signed hub tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: u64,
    pub jti: String,
}

/// Sign an HS256 token for `subject`.
pub fn sign_token(secret: &[u8], issuer: &str, subject: &str) -> Result<String> {
    let claims = Claims {
        iss: issuer.to_string(),
        sub: subject.to_string(),
        iat: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        jti: uuid::Uuid::new_v4().to_string(),
    };

    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| Error::Authentication(format!("failed to sign token: {e}")))
}

/// Validate a bearer token against the shared secret. Invalid claims close
/// the offending session.
pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    // Tokens carry iat/jti, not exp; expiry is not part of the contract.
    validation.required_spec_claims.clear();
    validation.validate_exp = false;

    decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::Authentication(format!("invalid token: {e}")))
}

/// Resolve the JWT secret from an environment variable or a file, the env
/// var winning when both are set.
pub fn secret_from(env_var: Option<&str>, file: Option<&Path>) -> Result<Vec<u8>> {
    if let Some(var) = env_var.filter(|v| !v.is_empty()) {
        if let Ok(secret) = std::env::var(var) {
            if !secret.is_empty() {
                return Ok(secret.into_bytes());
            }
        }
    }

    if let Some(path) = file {
        let secret = std::fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read JWT secret {path:?}: {e}")))?;
        if secret.is_empty() {
            return Err(Error::Config(format!("JWT secret file {path:?} is empty")));
        }
        return Ok(secret);
    }

    Err(Error::Config("no JWT secret configured".into()))
}

/// Resolve a bearer token the same way (env var first, then file).
pub fn token_from(env_var: Option<&str>, file: Option<&Path>) -> Option<String> {
    if let Some(var) = env_var.filter(|v| !v.is_empty()) {
        if let Ok(token) = std::env::var(var) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Some(token);
            }
        }
    }

    if let Some(path) = file {
        if let Ok(data) = std::fs::read_to_string(path) {
            let token = data.trim().to_string();
            if !token.is_empty() {
                return Some(token);
            }
        }
    }

    None
}

/// Load a CA pool from PEM files. An empty list yields an empty store (the
/// caller decides whether to fall back to system roots).
pub fn load_ca_pool(paths: &[PathBuf]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for path in paths {
        let pem = std::fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read CA {path:?}: {e}")))?;
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Config(format!("failed to parse CA {path:?}: {e}")))?;
        for cert in certs {
            store
                .add(cert)
                .map_err(|e| Error::Config(format!("failed to add CA from {path:?}: {e}")))?;
        }
    }
    Ok(store)
}

/// Load a PEM certificate chain and its private key.
pub fn load_cert_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| Error::Config(format!("failed to read cert {cert_path:?}: {e}")))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Config(format!("failed to parse cert {cert_path:?}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates in {cert_path:?}")));
    }

    let key_pem = std::fs::read(key_path)
        .map_err(|e| Error::Config(format!("failed to read key {key_path:?}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::Config(format!("failed to parse key {key_path:?}: {e}")))?
        .ok_or_else(|| Error::Config(format!("no private key in {key_path:?}")))?;

    Ok((certs, key))
}

/// Generate an ephemeral self-signed certificate. Used by tests and by
/// hubs started without configured certificates.
pub fn self_signed_cert(
    names: Vec<String>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| TransportError::Tls(format!("self-signed generation failed: {e}")))?;
    let cert_der = cert.cert.der().clone();
    let key: PrivateKeyDer<'static> =
        rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()).into();
    Ok((vec![cert_der], key))
}
