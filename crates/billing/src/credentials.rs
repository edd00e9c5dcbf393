//! Encrypted-at-rest provider credentials with a short-lived in-process
//! cache, plus the runtime config layer that resolves per-environment keys
//! with process-env fallback.
//!
//! Reads never throw: a missing row, an inactive credential, or a
//! misconfigured encryption key all resolve to `None` so callers can fall
//! back. Writes fail loudly when the encryption key is absent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};

const CACHE_TTL: Duration = Duration::from_secs(30);
const ENCRYPTION_KEY_ENV: &str = "CREDENTIALS_ENCRYPTION_KEY";

#[derive(Clone)]
struct CachedValue {
    value: Option<String>,
    loaded_at: Instant,
}

/// Provider credentials, AES-256-GCM encrypted, cached for 30s.
#[derive(Clone)]
pub struct CredentialStore {
    pool: PgPool,
    cache: Arc<RwLock<HashMap<(String, String), CachedValue>>>,
}

impl CredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Decryption key from the environment: base64 of exactly 32 bytes.
    fn encryption_key() -> BillingResult<[u8; 32]> {
        let encoded = std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| {
            BillingError::Configuration(format!("{} not set", ENCRYPTION_KEY_ENV))
        })?;
        let bytes = BASE64.decode(encoded.trim()).map_err(|e| {
            BillingError::Configuration(format!("{} is not valid base64: {}", ENCRYPTION_KEY_ENV, e))
        })?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            BillingError::Configuration(format!(
                "{} must decode to exactly 32 bytes",
                ENCRYPTION_KEY_ENV
            ))
        })?;
        Ok(key)
    }

    /// Fetch and decrypt a credential. Never errors: configuration problems
    /// and absent/inactive rows all return `None`.
    pub async fn get(&self, provider: &str, key: &str) -> Option<String> {
        let cache_key = (provider.to_string(), key.to_string());

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&cache_key) {
                if entry.loaded_at.elapsed() < CACHE_TTL {
                    return entry.value.clone();
                }
            }
        }

        let value = self.load(provider, key).await;

        let mut cache = self.cache.write().await;
        cache.insert(
            cache_key,
            CachedValue {
                value: value.clone(),
                loaded_at: Instant::now(),
            },
        );
        value
    }

    async fn load(&self, provider: &str, key: &str) -> Option<String> {
        let encryption_key = match Self::encryption_key() {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(provider = provider, key = key, error = %e, "Credential read without encryption key");
                return None;
            }
        };

        let row: Option<(String, bool)> = sqlx::query_as(
            "SELECT value_enc, active FROM credentials WHERE provider = $1 AND key = $2",
        )
        .bind(provider)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(provider = provider, key = key, error = %e, "Credential lookup failed");
            None
        });

        let (value_enc, active) = row?;
        if !active {
            return None;
        }

        match decrypt(&encryption_key, &value_enc) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                tracing::error!(provider = provider, key = key, error = %e, "Credential decryption failed");
                None
            }
        }
    }

    /// Encrypt and upsert a credential, then invalidate the cache entry.
    /// Fails loudly when the encryption key is not configured.
    pub async fn set(&self, provider: &str, key: &str, plaintext: &str) -> BillingResult<()> {
        let encryption_key = Self::encryption_key()?;
        let value_enc = encrypt(&encryption_key, plaintext)?;

        sqlx::query(
            r#"
            INSERT INTO credentials (provider, key, value_enc, active, updated_at)
            VALUES ($1, $2, $3, TRUE, NOW())
            ON CONFLICT (provider, key)
            DO UPDATE SET value_enc = EXCLUDED.value_enc, active = TRUE, updated_at = NOW()
            "#,
        )
        .bind(provider)
        .bind(key)
        .bind(&value_enc)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let mut cache = self.cache.write().await;
        cache.remove(&(provider.to_string(), key.to_string()));

        tracing::info!(provider = provider, key = key, "Credential stored");
        Ok(())
    }
}

/// Encrypt to `base64(nonce):base64(ciphertext)`.
fn encrypt(key: &[u8; 32], plaintext: &str) -> BillingResult<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BillingError::Configuration(format!("cipher init failed: {}", e)))?;

    let mut nonce_bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| BillingError::Configuration(format!("encryption failed: {}", e)))?;

    Ok(format!(
        "{}:{}",
        BASE64.encode(nonce_bytes),
        BASE64.encode(ciphertext)
    ))
}

fn decrypt(key: &[u8; 32], stored: &str) -> BillingResult<String> {
    let (nonce_part, cipher_part) = stored
        .split_once(':')
        .ok_or_else(|| BillingError::Configuration("invalid encrypted format".into()))?;

    let nonce_bytes = BASE64
        .decode(nonce_part)
        .map_err(|e| BillingError::Configuration(format!("invalid nonce: {}", e)))?;
    if nonce_bytes.len() != 12 {
        return Err(BillingError::Configuration("invalid nonce length".into()));
    }
    let ciphertext = BASE64
        .decode(cipher_part)
        .map_err(|e| BillingError::Configuration(format!("invalid ciphertext: {}", e)))?;

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BillingError::Configuration(format!("cipher init failed: {}", e)))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| BillingError::Configuration("decryption failed".into()))?;

    String::from_utf8(plaintext)
        .map_err(|e| BillingError::Configuration(format!("invalid utf-8: {}", e)))
}

/// Deployment environment, selecting which credential variant applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Sandbox,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var("BILLFLOW_ENV").as_deref() {
            Ok("production") => Self::Production,
            _ => Self::Sandbox,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Self::Production => "PRODUCTION",
            Self::Sandbox => "SANDBOX",
        }
    }
}

/// Per-environment credential resolution with process-env fallback.
///
/// `resolve("processor", "PRIVATE_KEY")` in sandbox looks up the stored
/// credential `("processor", "PRIVATE_KEY_SANDBOX")`, then falls back to the
/// `PROCESSOR_PRIVATE_KEY` environment variable.
#[derive(Clone)]
pub struct RuntimeConfig {
    store: CredentialStore,
    environment: Environment,
}

impl RuntimeConfig {
    pub fn new(store: CredentialStore, environment: Environment) -> Self {
        Self { store, environment }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub async fn resolve(&self, provider: &str, key: &str) -> Option<String> {
        let env_key = format!("{}_{}", key, self.environment.suffix());
        if let Some(value) = self.store.get(provider, &env_key).await {
            return Some(value);
        }

        let fallback = format!("{}_{}", provider.to_ascii_uppercase(), key);
        std::env::var(&fallback).ok().filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let stored = encrypt(&key, "prv_test_12345").unwrap();
        assert!(stored.contains(':'));
        assert_eq!(decrypt(&key, &stored).unwrap(), "prv_test_12345");
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let stored = encrypt(&[7u8; 32], "secret").unwrap();
        assert!(decrypt(&[8u8; 32], &stored).is_err());
    }

    #[test]
    fn decrypt_rejects_malformed_input() {
        let key = [7u8; 32];
        assert!(decrypt(&key, "no-separator").is_err());
        assert!(decrypt(&key, "xx:yy").is_err());
    }

    #[test]
    fn nonces_are_unique_per_encryption() {
        let key = [7u8; 32];
        let a = encrypt(&key, "same").unwrap();
        let b = encrypt(&key, "same").unwrap();
        assert_ne!(a, b);
    }
}
