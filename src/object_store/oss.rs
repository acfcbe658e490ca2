use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use ring::hmac;
use serde::Deserialize;
use tracing::debug;

use super::policy::{oss_policy_document, AccessKeyRequest};
use super::{
    validate_key, AccessKey, Bucket, ObjectInfo, ObjectStoreError, Provider, PutObjectInput,
    SignerType, UploadInfo,
};

const MIN_TTL: Duration = Duration::from_secs(900);
const MAX_TTL: Duration = Duration::from_secs(3600);

const VERSION_ID_HEADER: &str = "x-oss-version-id";

#[derive(Debug, Clone)]
pub struct OssConfig {
    pub bucket: String,
    pub region: String,
    /// e.g. `oss-cn-hangzhou.aliyuncs.com`, optionally with a scheme.
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// e.g. `sts.aliyuncs.com`, optionally with a scheme.
    pub sts_endpoint: String,
    pub role_arn: String,
    pub public_endpoint: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// OSS bucket over the REST API with V1 header signatures.
pub struct OssStore {
    bucket: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    role_arn: String,
    public_endpoint: String,
    bucket_url: Url,
    sts_url: Url,
    client: Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    credentials: StsCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    access_key_secret: String,
    security_token: String,
    expiration: String,
}

impl OssStore {
    pub fn new(config: OssConfig) -> Result<Self, ObjectStoreError> {
        let (scheme, host) = split_endpoint(&config.endpoint);
        let bucket_url = Url::parse(&format!("{scheme}://{}.{host}/", config.bucket))
            .map_err(|e| ObjectStoreError::InvalidRequest(format!("invalid OSS endpoint: {e}")))?;
        let (sts_scheme, sts_host) = split_endpoint(&config.sts_endpoint);
        let sts_url = Url::parse(&format!("{sts_scheme}://{sts_host}/"))
            .map_err(|e| ObjectStoreError::InvalidRequest(format!("invalid STS endpoint: {e}")))?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        Ok(Self {
            bucket: config.bucket,
            region: config.region,
            access_key_id: config.access_key_id,
            secret_access_key: config.secret_access_key,
            role_arn: config.role_arn,
            public_endpoint: config.public_endpoint,
            bucket_url,
            sts_url,
            client,
        })
    }

    fn object_url(&self, key: &str) -> Url {
        let mut url = self.bucket_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(key.split('/'));
        }
        url
    }

    /// Sign and send one request. `sub_resource` takes part in the signature,
    /// `query` does not.
    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        sub_resource: Option<(&str, &str)>,
        query: &[(&str, &str)],
        oss_headers: Vec<(String, String)>,
        content_type: &str,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, ObjectStoreError> {
        let mut url = match key {
            Some(key) => self.object_url(key),
            None => self.bucket_url.clone(),
        };
        {
            let mut pairs = url.query_pairs_mut();
            if let Some((name, value)) = sub_resource {
                pairs.append_pair(name, value);
            }
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        let mut resource = format!("/{}/{}", self.bucket, key.unwrap_or_default());
        if let Some((name, value)) = sub_resource {
            resource.push_str(&format!("?{name}={value}"));
        }

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let to_sign = string_to_sign(
            method.as_str(),
            "",
            content_type,
            &date,
            &oss_headers,
            &resource,
        );
        let signature = sign_v1(&self.secret_access_key, &to_sign);

        let mut request = self
            .client
            .request(method, url)
            .header("Date", &date)
            .header(
                "Authorization",
                format!("OSS {}:{signature}", self.access_key_id),
            );
        if !content_type.is_empty() {
            request = request.header("Content-Type", content_type);
        }
        for (name, value) in &oss_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }

    async fn read_object(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<Bytes, ObjectStoreError> {
        let resp = self
            .send(
                Method::GET,
                Some(key),
                version_id.map(|v| ("versionId", v)),
                &[],
                Vec::new(),
                "",
                None,
            )
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            let name = match version_id {
                Some(v) => format!("{key}@{v}"),
                None => key.to_string(),
            };
            return Err(ObjectStoreError::NotFound(name));
        }
        let resp = ensure_success(resp, "OSS download").await?;
        resp.bytes()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }
}

async fn ensure_success(
    resp: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, ObjectStoreError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ObjectStoreError::Backend(format!(
        "{what} failed ({status}): {body}"
    )))
}

fn version_header(resp: &reqwest::Response) -> String {
    resp.headers()
        .get(VERSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn split_endpoint(endpoint: &str) -> (&str, &str) {
    let endpoint = endpoint.trim_end_matches('/');
    match endpoint.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None => ("https", endpoint),
    }
}

fn string_to_sign(
    verb: &str,
    content_md5: &str,
    content_type: &str,
    date: &str,
    oss_headers: &[(String, String)],
    resource: &str,
) -> String {
    let mut headers: Vec<(String, &str)> = oss_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .filter(|(name, _)| name.starts_with("x-oss-"))
        .collect();
    headers.sort();

    let mut out = format!("{verb}\n{content_md5}\n{content_type}\n{date}\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}:{value}\n"));
    }
    out.push_str(resource);
    out
}

fn sign_v1(secret: &str, string_to_sign: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let tag = hmac::sign(&key, string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(tag.as_ref())
}

/// Canonical query string for the STS RPC signature: sorted, RFC 3986 encoded.
fn canonical_query(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign_rpc(secret: &str, method: &str, canonical: &str) -> String {
    let to_sign = format!(
        "{method}&{}&{}",
        urlencoding::encode("/"),
        urlencoding::encode(canonical)
    );
    sign_v1(&format!("{secret}&"), &to_sign)
}

/// Pull the text of every `<tag>` element out of a flat XML listing.
/// One page of a ListObjectsV2 response.
#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    next_token: Option<String>,
}

fn parse_list_page(xml: &str) -> Result<ListPage, ObjectStoreError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| ObjectStoreError::Backend(format!("OSS list response: {e}")))?;
    let root = doc.root_element();

    let keys = root
        .children()
        .filter(|n| n.has_tag_name("Contents"))
        .filter_map(|contents| contents.children().find(|n| n.has_tag_name("Key")))
        .map(|key| element_text(&key))
        .collect();

    let truncated = root
        .children()
        .find(|n| n.has_tag_name("IsTruncated"))
        .is_some_and(|n| element_text(&n).trim() == "true");
    let next_token = root
        .children()
        .find(|n| n.has_tag_name("NextContinuationToken"))
        .map(|n| element_text(&n))
        .filter(|token| truncated && !token.is_empty());

    Ok(ListPage { keys, next_token })
}

/// Concatenated text of an element, entities and CDATA already decoded.
fn element_text(node: &roxmltree::Node) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

#[async_trait]
impl Bucket for OssStore {
    fn provider(&self) -> Provider {
        Provider::Oss
    }

    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    fn region(&self) -> &str {
        &self.region
    }

    fn public_endpoint(&self) -> &str {
        &self.public_endpoint
    }

    async fn put_object(&self, input: PutObjectInput) -> Result<UploadInfo, ObjectStoreError> {
        let key = validate_key(&input.name)?.to_string();
        let content_type = input.resolved_content_type();
        let size = input.size();

        let resp = self
            .send(
                Method::PUT,
                Some(&key),
                None,
                &[],
                Vec::new(),
                &content_type,
                Some(input.data),
            )
            .await?;
        let resp = ensure_success(resp, "OSS upload").await?;

        debug!(key = %key, size, "Stored object");
        Ok(UploadInfo {
            version_id: version_header(&resp),
        })
    }

    async fn get_object(&self, name: &str) -> Result<Bytes, ObjectStoreError> {
        let key = validate_key(name)?;
        self.read_object(key, None).await
    }

    async fn get_object_version(
        &self,
        name: &str,
        version_id: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        let key = validate_key(name)?;
        self.read_object(key, Some(version_id)).await
    }

    async fn get_object_info(&self, name: &str) -> Result<ObjectInfo, ObjectStoreError> {
        let key = validate_key(name)?;
        let resp = self
            .send(Method::HEAD, Some(key), None, &[], Vec::new(), "", None)
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        let resp = ensure_success(resp, "OSS head").await?;

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Ok(ObjectInfo {
            version_id: version_header(&resp),
            size,
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let prefix = prefix.trim_start_matches('/');
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = &continuation_token {
                query.push(("continuation-token", token.as_str()));
            }

            let resp = self
                .send(Method::GET, None, None, &query, Vec::new(), "", None)
                .await?;
            let body = ensure_success(resp, "OSS list")
                .await?
                .text()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

            let page = parse_list_page(&body)?;
            keys.extend(page.keys);
            match page.next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn copy_object(&self, src: &str, dest: &str) -> Result<UploadInfo, ObjectStoreError> {
        let src = validate_key(src)?;
        let dest = validate_key(dest)?;
        let source = format!("/{}/{}", self.bucket, urlencoding::encode(src));

        let resp = self
            .send(
                Method::PUT,
                Some(dest),
                None,
                &[],
                vec![("x-oss-copy-source".to_string(), source)],
                "",
                None,
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(src.to_string()));
        }
        let resp = ensure_success(resp, "OSS copy").await?;

        Ok(UploadInfo {
            version_id: version_header(&resp),
        })
    }

    async fn generate_access_key(
        &self,
        request: &AccessKeyRequest,
    ) -> Result<AccessKey, ObjectStoreError> {
        request.validate(MIN_TTL, MAX_TTL)?;

        let policy = oss_policy_document(&self.bucket, request).to_string();
        let requested_expiry =
            Utc::now() + chrono::Duration::seconds(request.ttl.as_secs() as i64);

        let mut params: Vec<(String, String)> = [
            ("Action", "AssumeRole".to_string()),
            ("Format", "JSON".to_string()),
            ("Version", "2015-04-01".to_string()),
            ("AccessKeyId", self.access_key_id.clone()),
            ("SignatureMethod", "HMAC-SHA1".to_string()),
            ("SignatureVersion", "1.0".to_string()),
            ("SignatureNonce", uuid::Uuid::new_v4().to_string()),
            (
                "Timestamp",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
            ("RoleArn", self.role_arn.clone()),
            ("RoleSessionName", request.session_name.clone()),
            ("Policy", policy),
            ("DurationSeconds", request.ttl.as_secs().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let signature = sign_rpc(&self.secret_access_key, "GET", &canonical_query(&params));
        params.push(("Signature".to_string(), signature));

        let resp = self
            .client
            .get(self.sts_url.clone())
            .query(&params)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        let resp = ensure_success(resp, "OSS AssumeRole").await?;
        let body: AssumeRoleResponse = resp
            .json()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("malformed AssumeRole response: {e}")))?;

        let reported_expiry = DateTime::parse_from_rfc3339(&body.credentials.expiration)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(requested_expiry);

        Ok(AccessKey {
            access_key: body.credentials.access_key_id,
            secret_access_key: body.credentials.access_key_secret,
            session_token: body.credentials.security_token,
            signer_type: SignerType::Oss,
            expires_at: reported_expiry.min(requested_expiry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_to_sign_sorts_oss_headers() {
        let headers = vec![
            ("X-OSS-Meta-Author".to_string(), "foo".to_string()),
            ("x-oss-copy-source".to_string(), "/b/a.json".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
        ];
        let s = string_to_sign(
            "PUT",
            "",
            "application/json",
            "Thu, 17 Nov 2005 18:49:58 GMT",
            &headers,
            "/b/dest.json",
        );
        assert_eq!(
            s,
            "PUT\n\napplication/json\nThu, 17 Nov 2005 18:49:58 GMT\n\
             x-oss-copy-source:/b/a.json\nx-oss-meta-author:foo\n/b/dest.json"
        );
    }

    #[test]
    fn signatures_are_base64_sha1() {
        let a = sign_v1("secret", "GET\n\n\ndate\n/b/k");
        let b = sign_v1("secret", "GET\n\n\ndate\n/b/k");
        let c = sign_v1("other", "GET\n\n\ndate\n/b/k");
        assert_eq!(a, b);
        assert_ne!(a, c);
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&a)
            .unwrap();
        assert_eq!(raw.len(), 20);
    }

    #[test]
    fn canonical_query_is_sorted_and_encoded() {
        let params = vec![
            ("RoleSessionName".to_string(), "U7D1".to_string()),
            ("Action".to_string(), "AssumeRole".to_string()),
            ("Policy".to_string(), "{\"a\": 1}".to_string()),
        ];
        assert_eq!(
            canonical_query(&params),
            "Action=AssumeRole&Policy=%7B%22a%22%3A%201%7D&RoleSessionName=U7D1"
        );
    }

    #[test]
    fn listing_pages_follow_the_continuation_token() {
        let xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                   <ListBucketResult><Name>docs</Name><IsTruncated>true</IsTruncated>\
                   <Contents><Key>a/pages/p1.json</Key><Size>12</Size></Contents>\
                   <Contents><Key>a/medias/x&amp;y.png</Key></Contents>\
                   <NextContinuationToken>tok</NextContinuationToken></ListBucketResult>";
        let page = parse_list_page(xml).unwrap();
        assert_eq!(page.keys, vec!["a/pages/p1.json", "a/medias/x&y.png"]);
        assert_eq!(page.next_token.as_deref(), Some("tok"));
    }

    #[test]
    fn listing_keys_decode_references_and_cdata() {
        let xml = "<ListBucketResult><IsTruncated>false</IsTruncated>\
                   <Contents><Key>a/medias/x&#38;y.png</Key></Contents>\
                   <Contents><Key><![CDATA[a/b.png]]></Key></Contents>\
                   <Contents><Key>a/medias/&#x4e2d;.png</Key></Contents>\
                   <NextContinuationToken>ignored</NextContinuationToken></ListBucketResult>";
        let page = parse_list_page(xml).unwrap();
        assert_eq!(
            page.keys,
            vec!["a/medias/x&y.png", "a/b.png", "a/medias/\u{4e2d}.png"]
        );
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn malformed_listing_is_a_backend_error() {
        let err = parse_list_page("<ListBucketResult><Contents>").unwrap_err();
        assert!(matches!(err, ObjectStoreError::Backend(_)));
    }

    #[test]
    fn endpoints_default_to_https() {
        assert_eq!(
            split_endpoint("oss-cn-hangzhou.aliyuncs.com"),
            ("https", "oss-cn-hangzhou.aliyuncs.com")
        );
        assert_eq!(
            split_endpoint("http://127.0.0.1:9000/"),
            ("http", "127.0.0.1:9000")
        );
    }

    #[test]
    fn object_urls_encode_segments() {
        let store = OssStore::new(OssConfig {
            bucket: "docs".to_string(),
            region: "cn-hangzhou".to_string(),
            endpoint: "oss-cn-hangzhou.aliyuncs.com".to_string(),
            access_key_id: "ak".to_string(),
            secret_access_key: "sk".to_string(),
            sts_endpoint: "sts.aliyuncs.com".to_string(),
            role_arn: "acs:ram::1:role/r".to_string(),
            public_endpoint: String::new(),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(
            store.object_url("abc/medias/my logo.png").as_str(),
            "https://docs.oss-cn-hangzhou.aliyuncs.com/abc/medias/my%20logo.png"
        );
    }
}
