//! Self-contained snapshot of an inbound HTTP request, persisted when the
//! downstream feed fails and replayed through the same handler later.

use axum::http::{header, request::Parts, Method, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use super::StorageError;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRequest {
    pub method: String,
    /// e.g. "HTTP/1.1"
    pub proto: String,
    pub proto_major: u32,
    pub proto_minor: u32,
    /// Header multimap, lowercase names
    pub header: BTreeMap<String, Vec<String>>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub content_length: i64,
    #[serde(default)]
    pub transfer_encoding: Vec<String>,
    #[serde(default)]
    pub close: bool,
    pub host: String,
    /// Query string fields followed by url-encoded body fields
    #[serde(default)]
    pub form: BTreeMap<String, Vec<String>>,
    /// Url-encoded body fields only
    #[serde(default)]
    pub post_form: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub remote_addr: String,
    pub request_uri: String,
    pub url: String,
}

impl BufferedRequest {
    /// Capture request head and body
    pub fn from_parts(parts: &Parts, body: &[u8], remote_addr: Option<SocketAddr>) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let (proto, proto_major, proto_minor) = match parts.version {
            Version::HTTP_09 => ("HTTP/0.9", 0, 9),
            Version::HTTP_10 => ("HTTP/1.0", 1, 0),
            Version::HTTP_2 => ("HTTP/2.0", 2, 0),
            Version::HTTP_3 => ("HTTP/3.0", 3, 0),
            _ => ("HTTP/1.1", 1, 1),
        };

        let header_str = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let host = header_str(header::HOST)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let content_length = header_str(header::CONTENT_LENGTH)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(body.len() as i64);

        let transfer_encoding = header_str(header::TRANSFER_ENCODING)
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let close = header_str(header::CONNECTION)
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        let is_form = header_str(header::CONTENT_TYPE)
            .map(|v| v.starts_with(FORM_CONTENT_TYPE))
            .unwrap_or(false);
        let post_form = if is_form
            && matches!(parts.method, Method::POST | Method::PUT | Method::PATCH)
        {
            parse_form(&String::from_utf8_lossy(body))
        } else {
            BTreeMap::new()
        };

        let mut form = parts.uri.query().map(parse_form).unwrap_or_default();
        for (k, vs) in &post_form {
            form.entry(k.clone()).or_default().extend(vs.iter().cloned());
        }

        Self {
            method: parts.method.to_string(),
            proto: proto.to_string(),
            proto_major,
            proto_minor,
            header: headers,
            body: body.to_vec(),
            content_length,
            transfer_encoding,
            close,
            host,
            form,
            post_form,
            remote_addr: remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            request_uri: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            url: parts.uri.to_string(),
        }
    }

    /// First value of a header (name is case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header
            .get(&name.to_ascii_lowercase())
            .and_then(|vs| vs.first())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupted(e.to_string()))
    }
}

fn parse_form(raw: &str) -> BTreeMap<String, Vec<String>> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw).unwrap_or_default();
    let mut form: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in pairs {
        form.entry(k).or_default().push(v);
    }
    form
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
