use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::{AppendToStreamOptions, ReadStreamOptions};
use crate::client::{CallOptions, Client};
use crate::error::{ClientError, ErrorCode};
use crate::types::{EventData, WriteResult};

/// Event type of metadata records.
pub const METADATA_EVENT_TYPE: &str = "$metadata";

/// Name of the stream holding the metadata of `stream`.
pub fn metadata_stream_name(stream: &str) -> String {
    format!("$${stream}")
}

/// Access control list of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAcl {
    #[serde(rename = "$r", default, skip_serializing_if = "Vec::is_empty", deserialize_with = "roles")]
    pub read_roles: Vec<String>,
    #[serde(rename = "$w", default, skip_serializing_if = "Vec::is_empty", deserialize_with = "roles")]
    pub write_roles: Vec<String>,
    #[serde(rename = "$d", default, skip_serializing_if = "Vec::is_empty", deserialize_with = "roles")]
    pub delete_roles: Vec<String>,
    #[serde(rename = "$mr", default, skip_serializing_if = "Vec::is_empty", deserialize_with = "roles")]
    pub meta_read_roles: Vec<String>,
    #[serde(rename = "$mw", default, skip_serializing_if = "Vec::is_empty", deserialize_with = "roles")]
    pub meta_write_roles: Vec<String>,
}

/// The server accepts a role list or a single role.
fn roles<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(role) => vec![role],
        OneOrMany::Many(roles) => roles,
    })
}

/// Either an explicit ACL or the name of a server-side default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Acl {
    /// `$userStreamAcl` or `$systemStreamAcl`.
    Named(String),
    Stream(StreamAcl),
}

impl Acl {
    pub fn user_stream() -> Self {
        Acl::Named("$userStreamAcl".to_string())
    }

    pub fn system_stream() -> Self {
        Acl::Named("$systemStreamAcl".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
    /// Seconds.
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<u64>,
    /// Seconds.
    #[serde(rename = "$cacheControl", default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<u64>,
    #[serde(rename = "$acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Acl>,
    /// User-defined properties.
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

impl StreamMetadata {
    pub fn with_max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn with_truncate_before(mut self, revision: u64) -> Self {
        self.truncate_before = Some(revision);
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}

/// Stream metadata with the revision of the record it was read from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionedMetadata {
    /// `None` when the stream never had metadata.
    pub revision: Option<u64>,
    pub metadata: StreamMetadata,
}

impl Client {
    /// Writes a new metadata record for `stream`.
    #[tracing::instrument(skip_all, fields(stream = %stream))]
    pub async fn set_stream_metadata(
        &self,
        stream: &str,
        options: &AppendToStreamOptions,
        metadata: &StreamMetadata,
    ) -> Result<WriteResult, ClientError> {
        let event = EventData::json(METADATA_EVENT_TYPE, metadata)?;
        self.append_to_stream(&metadata_stream_name(stream), options, vec![event])
            .await
    }

    /// Latest metadata of `stream`, or the defaults when none was ever set.
    #[tracing::instrument(skip_all, fields(stream = %stream))]
    pub async fn get_stream_metadata(
        &self,
        stream: &str,
        call: &CallOptions,
    ) -> Result<VersionedMetadata, ClientError> {
        let options = ReadStreamOptions {
            call: call.clone(),
            ..ReadStreamOptions::backwards().max_count(1)
        };
        let mut records = self
            .read_stream(&metadata_stream_name(stream), &options)
            .await?;
        let record = match records.next().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(VersionedMetadata::default()),
            Err(err) if err.is_code(ErrorCode::ResourceNotFound) => {
                return Ok(VersionedMetadata::default())
            }
            Err(err) => return Err(err),
        };

        let event = record.original_event();
        Ok(VersionedMetadata {
            revision: Some(event.revision),
            metadata: event.as_json()?,
        })
    }
}
