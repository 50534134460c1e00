use crate::{Credential, CredentialError, CredentialProvider, MAX_VALIDITY};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// 签名方案。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SasScheme {
    /// `urlencode(resource/identity) + "\n" + expiry`，时间单位为秒，
    /// token 形如 `SharedAccessSignature sr=..&sig=..&se=..`
    #[default]
    Legacy,
    /// `resource\nidentity\npolicy\nissued\nexpiry`，时间单位为毫秒，
    /// 签名作为二进制认证数据，签发/过期时间通过附加属性携带
    Mqtt5,
}

/// SAS token 生成器（持有已解码的共享密钥）。
#[derive(Clone)]
pub struct SasTokenGenerator {
    resource: String,
    identity: String,
    policy: Option<String>,
    key: Vec<u8>,
    validity: Duration,
    scheme: SasScheme,
}

impl SasTokenGenerator {
    /// 创建生成器，校验资源、身份与共享密钥。
    pub fn new(
        resource: impl Into<String>,
        identity: impl Into<String>,
        shared_key_base64: &str,
        validity: Duration,
        scheme: SasScheme,
    ) -> Result<Self, CredentialError> {
        let resource = resource.into();
        let identity = identity.into();
        if resource.trim().is_empty() {
            return Err(CredentialError::EmptyResource);
        }
        if identity.trim().is_empty() {
            return Err(CredentialError::EmptyIdentity);
        }
        if validity.is_zero() || validity > MAX_VALIDITY {
            return Err(CredentialError::InvalidValidity);
        }
        let key = decode_key(shared_key_base64)?;
        Ok(Self {
            resource,
            identity,
            policy: None,
            key,
            validity,
            scheme,
        })
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        let policy = policy.into();
        self.policy = if policy.is_empty() { None } else { Some(policy) };
        self
    }

    pub fn scheme(&self) -> SasScheme {
        self.scheme
    }

    /// 以指定时刻为签发时间生成凭据。
    pub fn generate_at(&self, now: SystemTime) -> Result<Credential, CredentialError> {
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        let credential = match self.scheme {
            SasScheme::Legacy => self.legacy(since_epoch)?,
            SasScheme::Mqtt5 => self.mqtt5(since_epoch)?,
        };
        debug!(
            target: "pubsub.auth",
            identity = %credential.identity,
            resource_uri = %credential.resource_uri,
            expiry = credential.expiry,
            scheme = ?credential.scheme,
            "credential_generated"
        );
        Ok(credential)
    }

    fn legacy(&self, since_epoch: Duration) -> Result<Credential, CredentialError> {
        let issued_at = since_epoch.as_secs();
        let expiry = issued_at
            .checked_add(self.validity.as_secs())
            .ok_or(CredentialError::InvalidValidity)?;
        let resource_uri = format!("{}/{}", self.resource.trim_end_matches('/'), self.identity);
        let encoded_uri = urlencoding::encode(&resource_uri);
        let string_to_sign = format!("{}\n{}", encoded_uri, expiry);
        let signature_bytes = sign(&self.key, &string_to_sign)?;
        let signature = STANDARD.encode(&signature_bytes);
        let mut token = format!(
            "SharedAccessSignature sr={}&sig={}&se={}",
            encoded_uri,
            urlencoding::encode(&signature),
            expiry
        );
        if let Some(policy) = &self.policy {
            token.push_str("&skn=");
            token.push_str(&urlencoding::encode(policy));
        }
        Ok(Credential {
            scheme: SasScheme::Legacy,
            identity: self.identity.clone(),
            resource_uri,
            issued_at,
            expiry,
            signature,
            signature_bytes,
            token,
        })
    }

    fn mqtt5(&self, since_epoch: Duration) -> Result<Credential, CredentialError> {
        let issued_at = millis(since_epoch)?;
        let expiry = issued_at
            .checked_add(millis(self.validity)?)
            .ok_or(CredentialError::InvalidValidity)?;
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}\n{}",
            self.resource,
            self.identity,
            self.policy.as_deref().unwrap_or(""),
            issued_at,
            expiry
        );
        let signature_bytes = sign(&self.key, &string_to_sign)?;
        let signature = STANDARD.encode(&signature_bytes);
        Ok(Credential {
            scheme: SasScheme::Mqtt5,
            identity: self.identity.clone(),
            resource_uri: self.resource.clone(),
            issued_at,
            expiry,
            token: signature.clone(),
            signature,
            signature_bytes,
        })
    }
}

impl CredentialProvider for SasTokenGenerator {
    fn issue(&self) -> Result<Credential, CredentialError> {
        self.generate_at(SystemTime::now())
    }
}

/// 以当前时间生成 Legacy 方案凭据。
pub fn generate(
    identity: &str,
    resource: &str,
    secret: &str,
    validity: Duration,
) -> Result<Credential, CredentialError> {
    generate_at(identity, resource, secret, validity, SystemTime::now())
}

/// 以指定时间生成 Legacy 方案凭据（便于复现签名）。
pub fn generate_at(
    identity: &str,
    resource: &str,
    secret: &str,
    validity: Duration,
    now: SystemTime,
) -> Result<Credential, CredentialError> {
    SasTokenGenerator::new(resource, identity, secret, validity, SasScheme::Legacy)?
        .generate_at(now)
}

fn millis(duration: Duration) -> Result<u64, CredentialError> {
    u64::try_from(duration.as_millis()).map_err(|_| CredentialError::InvalidValidity)
}

fn decode_key(shared_key_base64: &str) -> Result<Vec<u8>, CredentialError> {
    let trimmed = shared_key_base64.trim();
    if trimmed.is_empty() {
        return Err(CredentialError::InvalidSecret("empty".to_string()));
    }
    STANDARD
        .decode(trimmed)
        .map_err(|err| CredentialError::InvalidSecret(err.to_string()))
}

fn sign(key: &[u8], string_to_sign: &str) -> Result<Vec<u8>, CredentialError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|err| CredentialError::Signing(err.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_key_rejects_garbage() {
        assert!(matches!(
            decode_key("not base64!"),
            Err(CredentialError::InvalidSecret(_))
        ));
        assert!(matches!(
            decode_key("  "),
            Err(CredentialError::InvalidSecret(_))
        ));
        assert_eq!(decode_key("AAAA").expect("key"), vec![0u8, 0, 0]);
    }

    #[test]
    fn policy_is_appended_to_legacy_token() {
        let generator =
            SasTokenGenerator::new("hub.example", "dev1", "AAAA", Duration::from_secs(60), SasScheme::Legacy)
                .expect("generator")
                .with_policy("device");
        let credential = generator
            .generate_at(UNIX_EPOCH + Duration::from_secs(100))
            .expect("credential");
        assert!(credential.token.ends_with("&se=160&skn=device"));
    }
}
