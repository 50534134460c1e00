//! 凭据能力：基于共享密钥的限时签名凭据（SAS token）。

mod sas;

use std::fmt;
use std::time::Duration;

pub use sas::{SasScheme, SasTokenGenerator, generate, generate_at};

/// 常用有效期：一周。
pub const ONE_WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// 短期凭据有效期上限：40 分钟。
pub const SHORT_LIVED: Duration = Duration::from_secs(40 * 60);
/// 有效期上限：一年。
pub const MAX_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// MQTT 5 增强认证使用的认证方法名。
pub const SAS_AUTH_METHOD: &str = "SAS";

/// 凭据生成错误（在任何网络调用前失败）。
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("resource must not be empty")]
    EmptyResource,
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("invalid shared secret: {0}")]
    InvalidSecret(String),
    #[error("validity must be positive and at most one year")]
    InvalidValidity,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// 一次连接尝试使用的凭据，连接前生成，不持久化。
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub scheme: SasScheme,
    pub identity: String,
    pub resource_uri: String,
    /// 签发时间（单位由 scheme 决定：秒或毫秒）
    pub issued_at: u64,
    /// 过期时间（单位同 issued_at）
    pub expiry: u64,
    /// base64 编码后的签名
    pub signature: String,
    /// 原始签名字节（用作二进制认证数据）
    pub signature_bytes: Vec<u8>,
    /// 作为连接口令使用的 token 文本
    pub token: String,
}

impl Credential {
    /// 传输协议要求单独携带的附加属性。
    pub fn side_properties(&self) -> Vec<(String, String)> {
        match self.scheme {
            SasScheme::Legacy => Vec::new(),
            SasScheme::Mqtt5 => vec![
                ("sas-at".to_string(), self.issued_at.to_string()),
                ("sas-et".to_string(), self.expiry.to_string()),
            ],
        }
    }

    /// 以 scheme 对应的单位判断是否过期。
    pub fn is_expired_at(&self, now_in_scheme_units: u64) -> bool {
        now_in_scheme_units >= self.expiry
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("identity", &self.identity)
            .field("resource_uri", &self.resource_uri)
            .field("issued_at", &self.issued_at)
            .field("expiry", &self.expiry)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// 凭据提供者抽象：每次建立连接前调用一次。
pub trait CredentialProvider: Send + Sync {
    fn issue(&self) -> Result<Credential, CredentialError>;
}
