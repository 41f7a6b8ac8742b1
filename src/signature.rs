//! AWS4-HMAC-SHA256 request signing, exposed as a [`HeaderCallout`]
//! implementation so a `Filesystem`/`File` can be pointed at an S3-style
//! origin the same way it would be pointed at a plain WebDAV one.

use std::sync::Mutex;

use bytes::BytesMut;
use hmac::Hmac;
use http::HeaderMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::digest::Mac;
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::OffsetDateTime;
use url::Url;

use crate::callout::{HeaderCallout, HeaderPair};
use crate::constants::LONG_DATE_TIME;
use crate::credentials::{AccessKeyId, AccessKeySecret, Credentials};
use crate::error::{Error, ErrorKind};

const SHORT_DATE: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]");

const FRAGMENT: &AsciiSet = &CONTROLS
    // URL_RESERVED
    .add(b':')
    .add(b'?')
    .add(b'#')
    .add(b'[')
    .add(b']')
    .add(b'@')
    .add(b'!')
    .add(b'$')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b';')
    .add(b'=')
    // URL_UNSAFE
    .add(b'"')
    .add(b' ')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^')
    .add(b'`');

pub const FRAGMENT_SLASH: &AsciiSet = &FRAGMENT.add(b'/');

pub fn uri_encode(string: &str, encode_slash: bool) -> String {
    if encode_slash {
        utf8_percent_encode(string, FRAGMENT_SLASH).to_string()
    } else {
        utf8_percent_encode(string, FRAGMENT).to_string()
    }
}

/// Strips an `authz=` query parameter before computing a signature. A
/// caller's URL carries this when a prior request was itself brokered
/// through a bearer-token redirect; signing over it would bind the
/// signature to a token that is not part of the canonical S3 request.
fn strip_authz(url: &Url) -> Url {
    if !url.query_pairs().any(|(k, _)| k == "authz") {
        return url.clone();
    }
    let mut out = url.clone();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "authz")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        out.set_query(None);
    } else {
        out.query_pairs_mut().clear().extend_pairs(&kept);
    }
    out
}

fn canonical_uri_string(uri: &Url) -> String {
    let decoded = percent_encoding::percent_decode_str(uri.path()).decode_utf8_lossy();
    uri_encode(&decoded, false)
}

fn canonical_header_string(headers: &HeaderMap) -> Result<String, Error> {
    let mut keyvalues = Vec::with_capacity(12);
    for (key, value) in headers.iter() {
        keyvalues.push(format!(
            "{}:{}",
            key.as_str().to_lowercase(),
            value.to_str()?.trim()
        ))
    }
    keyvalues.sort();
    Ok(keyvalues.join("\n"))
}

fn canonical_query_string(uri: &Url) -> String {
    let mut keyvalues: Vec<(String, String)> = uri
        .query_pairs()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    keyvalues.sort();
    let keyvalues: Vec<String> = keyvalues
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, FRAGMENT_SLASH),
                utf8_percent_encode(v, FRAGMENT_SLASH)
            )
        })
        .collect();
    keyvalues.join("&")
}

pub fn signed_header_string(headers: &HeaderMap) -> String {
    let mut keys = headers
        .keys()
        .map(|key| key.as_str().to_lowercase())
        .collect::<Vec<String>>();
    keys.sort();
    keys.join(";")
}

pub fn canonical_request(
    method: &http::Method,
    host: &Url,
    headers: &HeaderMap,
    sha256: &str,
) -> Result<String, Error> {
    Ok(format!(
        "{}\n{}\n{}\n{}\n\n{}\n{}",
        method.as_str(),
        canonical_uri_string(host),
        canonical_query_string(host),
        canonical_header_string(headers)?,
        signed_header_string(headers),
        sha256
    ))
}

fn scope_string(datetime: &OffsetDateTime, region: &str) -> Result<String, Error> {
    Ok(format!(
        "{}/{}/s3/aws4_request",
        datetime
            .format(SHORT_DATE)
            .map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))?,
        region,
    ))
}

pub fn string_to_sign(
    datetime: &OffsetDateTime,
    region: &str,
    canonical_req: &[u8],
) -> Result<String, Error> {
    let mut hasher = Sha256::default();
    hasher.update(canonical_req);
    let string_to = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        datetime
            .format(LONG_DATE_TIME)
            .map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))?,
        scope_string(datetime, region)?,
        hex::encode(hasher.finalize().as_slice())
    );
    Ok(string_to)
}

pub fn signing_key(
    datetime: &OffsetDateTime,
    secret_key: &AccessKeySecret,
    region: &str,
) -> Result<Vec<u8>, Error> {
    let mk_hmac = |key: &[u8]| -> Result<Hmac<Sha256>, Error> {
        Hmac::<Sha256>::new_from_slice(key)
            .map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))
    };

    let mut secret = BytesMut::with_capacity(72);
    secret.extend(b"AWS4");
    secret.extend(secret_key.as_ref().as_bytes());

    let mut date_hmac = mk_hmac(secret.as_ref())?;
    date_hmac.update(
        datetime
            .format(SHORT_DATE)
            .map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))?
            .as_bytes(),
    );

    let mut region_hmac = mk_hmac(&date_hmac.finalize().into_bytes())?;
    region_hmac.update(region.as_bytes());

    let mut service_hmac = mk_hmac(&region_hmac.finalize().into_bytes())?;
    service_hmac.update(b"s3");

    let mut signing_hmac = mk_hmac(&service_hmac.finalize().into_bytes())?;
    signing_hmac.update(b"aws4_request");

    Ok(signing_hmac.finalize().into_bytes().to_vec())
}

pub fn authorization_header(
    access_key: &AccessKeyId,
    datetime: &OffsetDateTime,
    region: &str,
    signed_headers: &str,
    signature: &str,
) -> Result<String, Error> {
    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{},\
            SignedHeaders={},Signature={}",
        access_key.as_ref(),
        scope_string(datetime, region)?,
        signed_headers,
        signature,
    ))
}

/// A [`HeaderCallout`] that signs every request with AWS SigV4, the way an
/// S3-origin `Filesystem`/`File` pair would be configured.
///
/// `GetHeaders` is infallible by trait contract, so any signing failure
/// (e.g. a header value that isn't valid UTF-8) degrades to passing the
/// caller's headers through unsigned rather than panicking; the worker
/// will then see the origin reject the request with 403 and surface
/// `NotAuthorized`, same as a expired/invalid signature would.
pub struct S3Signer {
    credentials: Credentials,
    region: String,
    // `now` is overridable only for tests, since `Instant`/`OffsetDateTime::now_utc`
    // are not available inside workflow scripts but are fine at normal runtime.
    clock_override: Mutex<Option<OffsetDateTime>>,
}

impl S3Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            clock_override: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_fixed_clock(credentials: Credentials, region: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            credentials,
            region: region.into(),
            clock_override: Mutex::new(Some(now)),
        }
    }

    fn now(&self) -> OffsetDateTime {
        self.clock_override
            .lock()
            .ok()
            .and_then(|g| *g)
            .unwrap_or_else(OffsetDateTime::now_utc)
    }

    fn sign(&self, verb: &str, url: &Url, existing: &[HeaderPair]) -> Result<Vec<HeaderPair>, Error> {
        let url = &strip_authz(url);
        let now = self.now();
        let date_header = now
            .format(LONG_DATE_TIME)
            .map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (k, v) in existing {
            let name = http::HeaderName::from_bytes(k.as_bytes())?;
            let value = http::HeaderValue::from_str(v)?;
            headers.insert(name, value);
        }
        if headers.get(http::header::HOST).is_none() {
            if let Some(host) = url.host_str() {
                headers.insert(http::header::HOST, http::HeaderValue::from_str(host)?);
            }
        }
        headers.insert(
            http::HeaderName::from_static("x-amz-date"),
            http::HeaderValue::from_str(&date_header)?,
        );
        if headers
            .get("x-amz-content-sha256")
            .is_none()
        {
            headers.insert(
                http::HeaderName::from_static("x-amz-content-sha256"),
                http::HeaderValue::from_static(crate::constants::EMPTY_PAYLOAD_SHA),
            );
        }

        let method = http::Method::from_bytes(verb.as_bytes())
            .map_err(|_| Error::new(ErrorKind::InvalidArgs, format!("bad verb {verb}")))?;
        let sha256 = headers
            .get("x-amz-content-sha256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(crate::constants::EMPTY_PAYLOAD_SHA)
            .to_string();

        let canonical = canonical_request(&method, url, &headers, &sha256)?;
        let string_to_sign = string_to_sign(&now, &self.region, canonical.as_bytes())?;
        let key = signing_key(&now, &self.credentials.access_key_secret, &self.region)?;
        let mut hmac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))?;
        hmac.update(string_to_sign.as_bytes());
        let signature = hex::encode(hmac.finalize().into_bytes());

        let authorization = authorization_header(
            &self.credentials.access_key_id,
            &now,
            &self.region,
            &signed_header_string(&headers),
            &signature,
        )?;

        let mut out: Vec<HeaderPair> = headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        out.push(("Authorization".to_string(), authorization));
        Ok(out)
    }
}

impl HeaderCallout for S3Signer {
    fn get_headers(&self, verb: &str, url: &Url, existing: &[HeaderPair]) -> Vec<HeaderPair> {
        match self.sign(verb, url, existing) {
            Ok(headers) => headers,
            Err(e) => {
                tracing::warn!(error = %e, "S3 signing failed, sending request unsigned");
                existing.to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use http::header::{HeaderName, HOST, RANGE};
    use time::Date;

    use super::*;

    #[test]
    fn test_base_url_encode() {
        let url = Url::parse("http://s3.amazonaws.com/examplebucket///foo//bar//baz").unwrap();
        let canonical = canonical_uri_string(&url);
        assert_eq!("/examplebucket///foo//bar//baz", canonical);
    }

    #[test]
    fn test_path_encode() {
        let url = Url::parse("http://s3.amazonaws.com/bucket/Filename (xx)%=").unwrap();
        let canonical = canonical_uri_string(&url);
        assert_eq!("/bucket/Filename%20%28xx%29%25%3D", canonical);
    }

    #[test]
    fn test_query_string_encode() {
        let url = Url::parse(
            "http://s3.amazonaws.com/examplebucket?prefix=somePrefix&marker=someMarker&max-keys=20",
        )
        .unwrap();
        let canonical = canonical_query_string(&url);
        assert_eq!("marker=someMarker&max-keys=20&prefix=somePrefix", canonical);

        let url = Url::parse("http://s3.amazonaws.com/examplebucket?acl").unwrap();
        let canonical = canonical_query_string(&url);
        assert_eq!("acl=", canonical);
    }

    #[test]
    fn test_headers_encode() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-amz-date"),
            "20130708T220855Z".parse().unwrap(),
        );
        headers.insert(HeaderName::from_static("foo"), "bAr".parse().unwrap());
        headers.insert(HOST, "s3.amazonaws.com".parse().unwrap());
        let canonical = canonical_header_string(&headers).unwrap();
        let expected = "foo:bAr\nhost:s3.amazonaws.com\nx-amz-date:20130708T220855Z";
        assert_eq!(expected, canonical);

        let signed = signed_header_string(&headers);
        assert_eq!("foo;host;x-amz-date", signed);
    }

    #[test]
    fn test_signing_key() {
        let key = AccessKeySecret::new("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string());
        let expected = "32f78051dcde24c552811d654f4a769112bb834b03975cdd6b1fd7d16248c269";
        let datetime = Date::from_calendar_date(2015, 8.try_into().unwrap(), 30)
            .unwrap()
            .with_hms(0, 0, 0)
            .unwrap()
            .assume_utc();
        let signature = signing_key(&datetime, &key, "us-east-1").unwrap();
        assert_eq!(expected, hex::encode(signature));
    }

    const EXPECTED_SHA: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[rustfmt::skip]
    const EXPECTED_CANONICAL_REQUEST: &str =
        "GET\n\
         /test.txt\n\
         \n\
         host:examplebucket.s3.amazonaws.com\n\
         range:bytes=0-9\n\
         x-amz-content-sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\
         x-amz-date:20130524T000000Z\n\
         \n\
         host;range;x-amz-content-sha256;x-amz-date\n\
         e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[rustfmt::skip]
    const EXPECTED_STRING_TO_SIGN: &str =
        "AWS4-HMAC-SHA256\n\
         20130524T000000Z\n\
         20130524/us-east-1/s3/aws4_request\n\
         7344ae5b7ee6c3e7e6b0fe0640412a37625d1fbfff95c48bbb2dc43964946972";

    #[test]
    fn test_signing() {
        let url = Url::parse("https://examplebucket.s3.amazonaws.com/test.txt").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-amz-date"),
            "20130524T000000Z".parse().unwrap(),
        );
        headers.insert(RANGE, "bytes=0-9".parse().unwrap());
        headers.insert(HOST, "examplebucket.s3.amazonaws.com".parse().unwrap());
        headers.insert(
            HeaderName::from_static("x-amz-content-sha256"),
            EXPECTED_SHA.parse().unwrap(),
        );
        let canonical =
            canonical_request(&http::Method::GET, &url, &headers, EXPECTED_SHA).unwrap();
        assert_eq!(EXPECTED_CANONICAL_REQUEST, canonical);

        let datetime = Date::from_calendar_date(2013, 5.try_into().unwrap(), 24)
            .unwrap()
            .with_hms(0, 0, 0)
            .unwrap()
            .assume_utc();
        let string_to_sign = string_to_sign(&datetime, "us-east-1", canonical.as_bytes()).unwrap();
        assert_eq!(EXPECTED_STRING_TO_SIGN, string_to_sign);

        let expected = "f0e8bdb87c964420e857bd35b5d6ed310bd44f0170aba48dd91039c6036bdb41";
        let secret = AccessKeySecret::new("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string());
        let signing_key = signing_key(&datetime, &secret, "us-east-1");
        let mut hmac = Hmac::<Sha256>::new_from_slice(&signing_key.unwrap()).unwrap();
        hmac.update(string_to_sign.as_bytes());
        assert_eq!(expected, hex::encode(hmac.finalize().into_bytes()));
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode(r#"~!@#$%^&*()-_=+[]\{}|;:'",.<>? привет 你好"#, true), "~%21%40%23%24%25%5E%26%2A%28%29-_%3D%2B%5B%5D%5C%7B%7D%7C%3B%3A%27%22%2C.%3C%3E%3F%20%D0%BF%D1%80%D0%B8%D0%B2%D0%B5%D1%82%20%E4%BD%A0%E5%A5%BD");
    }

    #[test]
    fn strip_authz_removes_only_that_key() {
        let url = Url::parse("https://s3.example.com/obj?authz=tok123&prefix=a").unwrap();
        let stripped = strip_authz(&url);
        assert!(!stripped.query_pairs().any(|(k, _)| k == "authz"));
        assert!(stripped.query_pairs().any(|(k, v)| k == "prefix" && v == "a"));
    }

    #[test]
    fn strip_authz_is_noop_without_the_param() {
        let url = Url::parse("https://s3.example.com/obj?prefix=a").unwrap();
        let stripped = strip_authz(&url);
        assert_eq!(stripped.as_str(), url.as_str());
    }

    #[test]
    fn s3_signer_produces_authorization_header() {
        let datetime = Date::from_calendar_date(2013, 5.try_into().unwrap(), 24)
            .unwrap()
            .with_hms(0, 0, 0)
            .unwrap()
            .assume_utc();
        let signer = S3Signer::with_fixed_clock(
            Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY"),
            "us-east-1",
            datetime,
        );
        let url = Url::parse("https://examplebucket.s3.amazonaws.com/test.txt").unwrap();
        let headers = signer.get_headers("GET", &url, &[]);
        assert!(headers.iter().any(|(k, _)| k == "Authorization"));
    }
}
