use std::env;
use std::fmt::{Debug, Formatter};

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone)]
pub struct AccessKeyId(pub String);

impl AsRef<str> for AccessKeyId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl AccessKeyId {
    pub fn new(access_key_id: impl Into<String>) -> Self {
        Self(access_key_id.into())
    }
}

#[derive(Clone)]
pub struct AccessKeySecret(pub String);

impl Debug for AccessKeySecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccessKeySecret(<hidden>)")
    }
}

impl AsRef<str> for AccessKeySecret {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl AccessKeySecret {
    pub fn new(access_key_secret: impl Into<String>) -> Self {
        Self(access_key_secret.into())
    }
}

/// Credentials for the S3 request-signing `HeaderCallout`. Not used by the
/// plain WebDAV path, which authenticates via bearer tokens supplied as
/// ordinary request headers instead.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: AccessKeyId,
    pub access_key_secret: AccessKeySecret,
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            access_key_id: AccessKeyId(key.into()),
            access_key_secret: AccessKeySecret(secret.into()),
        }
    }

    pub fn try_from_env() -> Result<Self, Error> {
        let access_key_id = env::var("S3_ACCESS_KEY_ID")
            .map_err(|e| Error::new(ErrorKind::LoginFailed, format!("S3_ACCESS_KEY_ID: {e}")))?;
        let access_key_secret = env::var("S3_ACCESS_KEY_SECRET").map_err(|e| {
            Error::new(ErrorKind::LoginFailed, format!("S3_ACCESS_KEY_SECRET: {e}"))
        })?;

        Ok(Self {
            access_key_id: AccessKeyId(access_key_id),
            access_key_secret: AccessKeySecret(access_key_secret),
        })
    }
}
