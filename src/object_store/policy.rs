//! Least-privilege policy generation for scoped credentials.
//!
//! A request names one path glob (e.g. `{prefix}/*`) and a mask of
//! operations. Each operation bit maps to the provider's permission strings,
//! and the glob is the only object resource any statement grants.

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ObjectStoreError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthOps: u32 {
        const GET_OBJECT = 1 << 0;
        const PUT_OBJECT = 1 << 1;
        const DELETE_OBJECT = 1 << 2;
        const LIST_OBJECTS = 1 << 3;
        const READ = Self::GET_OBJECT.bits() | Self::LIST_OBJECTS.bits();
        const ALL = Self::GET_OBJECT.bits()
            | Self::PUT_OBJECT.bits()
            | Self::DELETE_OBJECT.bits()
            | Self::LIST_OBJECTS.bits();
    }
}

#[derive(Debug, Clone)]
pub struct AccessKeyRequest {
    /// Object glob relative to the bucket, `*` matches any run of characters.
    pub path_pattern: String,
    pub ops: AuthOps,
    pub ttl: Duration,
    /// Audit label attached to the assumed-role session.
    pub session_name: String,
}

impl AccessKeyRequest {
    pub fn new(path_pattern: impl Into<String>, ops: AuthOps, ttl: Duration) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            ops,
            ttl,
            session_name: "docstore".to_string(),
        }
    }

    pub fn with_session_name(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = session_name.into();
        self
    }

    /// Normalized pattern with the leading `/` removed.
    pub fn pattern(&self) -> &str {
        self.path_pattern.trim_start_matches('/')
    }

    /// Reject requests no provider could scope safely.
    pub fn validate(&self, min_ttl: Duration, max_ttl: Duration) -> Result<(), ObjectStoreError> {
        if self.pattern().is_empty() || self.pattern() == "*" {
            return Err(ObjectStoreError::InvalidRequest(
                "access key path must not cover the whole bucket".to_string(),
            ));
        }
        if self.ops.is_empty() {
            return Err(ObjectStoreError::InvalidRequest(
                "access key must grant at least one operation".to_string(),
            ));
        }
        if self.ttl < min_ttl || self.ttl > max_ttl {
            return Err(ObjectStoreError::InvalidRequest(format!(
                "access key ttl must be between {}s and {}s, got {}s",
                min_ttl.as_secs(),
                max_ttl.as_secs(),
                self.ttl.as_secs()
            )));
        }
        Ok(())
    }
}

const SINGLE_OPS: [AuthOps; 4] = [
    AuthOps::GET_OBJECT,
    AuthOps::PUT_OBJECT,
    AuthOps::DELETE_OBJECT,
    AuthOps::LIST_OBJECTS,
];

fn s3_actions(op: AuthOps) -> &'static [&'static str] {
    if op == AuthOps::GET_OBJECT {
        &["s3:GetObject", "s3:GetObjectVersion"]
    } else if op == AuthOps::PUT_OBJECT {
        &["s3:PutObject"]
    } else if op == AuthOps::DELETE_OBJECT {
        &["s3:DeleteObject", "s3:DeleteObjectVersion"]
    } else if op == AuthOps::LIST_OBJECTS {
        &["s3:ListBucket", "s3:ListBucketVersions"]
    } else {
        &[]
    }
}

fn oss_actions(op: AuthOps) -> &'static [&'static str] {
    if op == AuthOps::GET_OBJECT {
        &[
            "oss:GetObject",
            "oss:GetObjectAcl",
            "oss:GetObjectVersion",
            "oss:GetObjectVersionAcl",
        ]
    } else if op == AuthOps::PUT_OBJECT {
        &["oss:PutObject", "oss:PutObjectAcl", "oss:PutObjectVersionAcl"]
    } else if op == AuthOps::DELETE_OBJECT {
        &["oss:DeleteObject", "oss:DeleteObjectVersion"]
    } else if op == AuthOps::LIST_OBJECTS {
        &["oss:ListObjects", "oss:ListObjectVersions"]
    } else {
        &[]
    }
}

/// Provider actions for the requested bits. Listing is bucket-level, every
/// other operation is object-level.
fn collect_actions(
    ops: AuthOps,
    object_level: bool,
    map: fn(AuthOps) -> &'static [&'static str],
) -> Vec<&'static str> {
    SINGLE_OPS
        .into_iter()
        .filter(|op| ops.contains(*op))
        .filter(|op| (*op == AuthOps::LIST_OBJECTS) != object_level)
        .flat_map(map)
        .copied()
        .collect()
}

/// IAM policy document accepted by AWS STS and MinIO `AssumeRole`.
///
/// Object actions are granted on `arn:aws:s3:::{bucket}/{pattern}` only;
/// listing is granted on the bucket but conditioned on the same prefix glob.
pub fn s3_policy_document(bucket: &str, request: &AccessKeyRequest) -> Value {
    let pattern = request.pattern();
    let mut statements = Vec::new();

    let object_actions = collect_actions(request.ops, true, s3_actions);
    if !object_actions.is_empty() {
        statements.push(json!({
            "Effect": "Allow",
            "Action": object_actions,
            "Resource": [format!("arn:aws:s3:::{bucket}/{pattern}")],
        }));
    }

    let list_actions = collect_actions(request.ops, false, s3_actions);
    if !list_actions.is_empty() {
        statements.push(json!({
            "Effect": "Allow",
            "Action": list_actions,
            "Resource": [format!("arn:aws:s3:::{bucket}")],
            "Condition": { "StringLike": { "s3:prefix": [pattern] } },
        }));
    }

    json!({ "Version": "2012-10-17", "Statement": statements })
}

/// RAM policy document accepted by Alibaba Cloud STS `AssumeRole`.
pub fn oss_policy_document(bucket: &str, request: &AccessKeyRequest) -> Value {
    let pattern = request.pattern();
    let mut statements = Vec::new();

    let object_actions = collect_actions(request.ops, true, oss_actions);
    if !object_actions.is_empty() {
        statements.push(json!({
            "Effect": "Allow",
            "Action": object_actions,
            "Resource": [format!("acs:oss:*:*:{bucket}/{pattern}")],
        }));
    }

    let list_actions = collect_actions(request.ops, false, oss_actions);
    if !list_actions.is_empty() {
        statements.push(json!({
            "Effect": "Allow",
            "Action": list_actions,
            "Resource": [format!("acs:oss:*:*:{bucket}")],
            "Condition": { "StringLike": { "oss:Prefix": [pattern] } },
        }));
    }

    json!({ "Version": "1", "Statement": statements })
}

/// Policy embedded in credentials issued by the local backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedPolicy {
    pub access_key: String,
    pub bucket: String,
    pub pattern: String,
    /// `AuthOps` bits.
    pub ops: u32,
    /// Unix seconds.
    pub expires_at: i64,
}

impl ScopedPolicy {
    pub fn permits(&self, op: AuthOps, key: &str, now: i64) -> bool {
        now < self.expires_at
            && AuthOps::from_bits_truncate(self.ops).contains(op)
            && wildcard_match(&self.pattern, key)
    }
}

/// IAM-style wildcard match: `*` matches any run (including `/`), `?` one char.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, c));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if let Some((star_p, star_c)) = backtrack {
            p = star_p + 1;
            c = star_c + 1;
            backtrack = Some((star_p, star_c + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&ch| ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ops: AuthOps) -> AccessKeyRequest {
        AccessKeyRequest::new("/abc123/*", ops, Duration::from_secs(3600))
    }

    #[test]
    fn s3_read_policy_is_scoped_to_prefix() {
        let doc = s3_policy_document("documents", &request(AuthOps::READ));
        let statements = doc["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 2);

        assert_eq!(
            statements[0]["Resource"],
            json!(["arn:aws:s3:::documents/abc123/*"])
        );
        let actions = statements[0]["Action"].as_array().unwrap();
        assert!(actions.contains(&json!("s3:GetObject")));
        assert!(!actions.contains(&json!("s3:PutObject")));

        assert_eq!(statements[1]["Resource"], json!(["arn:aws:s3:::documents"]));
        assert_eq!(
            statements[1]["Condition"]["StringLike"]["s3:prefix"],
            json!(["abc123/*"])
        );
    }

    #[test]
    fn s3_write_only_policy_has_no_list_statement() {
        let doc = s3_policy_document("documents", &request(AuthOps::PUT_OBJECT));
        let statements = doc["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0]["Action"], json!(["s3:PutObject"]));
    }

    #[test]
    fn oss_policy_maps_every_bit() {
        let doc = oss_policy_document("documents", &request(AuthOps::ALL));
        assert_eq!(doc["Version"], "1");
        let actions = doc["Statement"][0]["Action"].as_array().unwrap();
        assert!(actions.contains(&json!("oss:GetObjectVersion")));
        assert!(actions.contains(&json!("oss:PutObject")));
        assert!(actions.contains(&json!("oss:DeleteObjectVersion")));
        assert_eq!(
            doc["Statement"][0]["Resource"],
            json!(["acs:oss:*:*:documents/abc123/*"])
        );
        assert_eq!(
            doc["Statement"][1]["Action"],
            json!(["oss:ListObjects", "oss:ListObjectVersions"])
        );
    }

    #[test]
    fn validate_rejects_bucket_wide_and_empty_requests() {
        let min = Duration::from_secs(900);
        let max = Duration::from_secs(43200);

        let whole_bucket = AccessKeyRequest::new("*", AuthOps::READ, Duration::from_secs(3600));
        assert!(whole_bucket.validate(min, max).is_err());

        let no_ops = AccessKeyRequest::new("a/*", AuthOps::empty(), Duration::from_secs(3600));
        assert!(no_ops.validate(min, max).is_err());

        let short = AccessKeyRequest::new("a/*", AuthOps::READ, Duration::from_secs(60));
        assert!(short.validate(min, max).is_err());

        assert!(request(AuthOps::READ).validate(min, max).is_ok());
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_match("abc/*", "abc/pages/p1.json"));
        assert!(wildcard_match("abc/*", "abc/"));
        assert!(!wildcard_match("abc/*", "abd/pages/p1.json"));
        assert!(!wildcard_match("abc/*", "abc"));
        assert!(wildcard_match("abc/pages/p?.json", "abc/pages/p1.json"));
        assert!(wildcard_match("abc/*/p1.json", "abc/pages/p1.json"));
        assert!(!wildcard_match("abc/*/p1.json", "abc/pages/p2.json"));
    }

    #[test]
    fn scoped_policy_checks_op_path_and_expiry() {
        let policy = ScopedPolicy {
            access_key: "LK".to_string(),
            bucket: "documents".to_string(),
            pattern: "abc/*".to_string(),
            ops: AuthOps::READ.bits(),
            expires_at: 1_000,
        };
        assert!(policy.permits(AuthOps::GET_OBJECT, "abc/document-meta.json", 999));
        assert!(!policy.permits(AuthOps::PUT_OBJECT, "abc/document-meta.json", 999));
        assert!(!policy.permits(AuthOps::GET_OBJECT, "other/document-meta.json", 999));
        assert!(!policy.permits(AuthOps::GET_OBJECT, "abc/document-meta.json", 1_000));
    }
}
