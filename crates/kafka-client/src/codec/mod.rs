//! Encoding and decoding of Kafka protocol frames.
//!
//! Request and response bodies are modeled by the `kafka_protocol` crate.
//! This module adds per-connection version negotiation, strict response
//! decoding, and the RecordBatch and consumer-protocol formats which are
//! carried as opaque bytes within those bodies.

use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use kafka_protocol::{
    messages::{self, ApiKey},
    protocol::{Decodable, Encodable, Request, StrBytes},
};
use std::collections::BTreeMap;

mod compression;
mod error_code;
pub mod group;
pub mod records;

pub use compression::{compress, decompress};
pub use error_code::ErrorCode;

/// Highest version of each API the client implements, and the lowest version
/// in which every field the client populates exists.
const SUPPORTED: &[(i16, i16, i16)] = &[
    (messages::ProduceRequest::KEY, 3, 9),
    (messages::FetchRequest::KEY, 4, 12),
    (messages::ListOffsetsRequest::KEY, 2, 7),
    (messages::MetadataRequest::KEY, 1, 12),
    (messages::OffsetCommitRequest::KEY, 2, 8),
    (messages::OffsetFetchRequest::KEY, 1, 7),
    (messages::FindCoordinatorRequest::KEY, 1, 4),
    (messages::JoinGroupRequest::KEY, 1, 9),
    (messages::HeartbeatRequest::KEY, 0, 4),
    (messages::LeaveGroupRequest::KEY, 0, 5),
    (messages::SyncGroupRequest::KEY, 0, 5),
    (messages::ApiVersionsRequest::KEY, 0, 3),
    (messages::InitProducerIdRequest::KEY, 0, 4),
];

/// The client's supported version range for an API key,
/// intersected with the range implemented by `kafka_protocol`.
fn client_range(api_key: i16) -> Option<(i16, i16)> {
    SUPPORTED
        .iter()
        .find(|(key, _, _)| *key == api_key)
        .map(|(_, min, max)| (*min, *max))
}

fn protocol_range<R: Request>() -> (i16, i16) {
    (R::VERSIONS.min, R::VERSIONS.max)
}

/// API versions negotiated with a single broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Versions {
    negotiated: BTreeMap<i16, i16>,
}

impl Versions {
    /// Intersect the versions offered in an ApiVersionsResponse with those
    /// of the client. APIs without an overlap are omitted.
    pub fn negotiate(response: &messages::ApiVersionsResponse) -> Self {
        let negotiated = response
            .api_keys
            .iter()
            .filter_map(|offered| {
                let (client_min, client_max) = client_range(offered.api_key)?;
                let min = client_min.max(offered.min_version);
                let max = client_max.min(offered.max_version);
                (min <= max).then_some((offered.api_key, max))
            })
            .collect();

        Self { negotiated }
    }

    /// Negotiated version of request `R`.
    pub fn version<R: Request>(&self) -> Result<i16> {
        let (proto_min, proto_max) = protocol_range::<R>();

        match self.negotiated.get(&R::KEY) {
            Some(version) if (proto_min..=proto_max).contains(version) => Ok(*version),
            Some(version) if *version > proto_max && proto_max >= proto_min => Ok(proto_max),
            _ => Err(Error::UnsupportedVersion { api_key: R::KEY }),
        }
    }

    #[cfg(test)]
    pub fn all_max() -> Self {
        Self {
            negotiated: SUPPORTED.iter().map(|(key, _, max)| (*key, *max)).collect(),
        }
    }
}

/// The version ranges this client implements, as an ApiVersionsResponse.
/// Used to answer ApiVersions requests in tests.
pub fn supported_api_versions() -> Vec<messages::api_versions_response::ApiVersion> {
    SUPPORTED
        .iter()
        .map(|(key, min, max)| {
            messages::api_versions_response::ApiVersion::default()
                .with_api_key(*key)
                .with_min_version(*min)
                .with_max_version(*max)
        })
        .collect()
}

/// Encode the header and body of request `R` at `version`.
/// The returned bytes exclude the 4-byte length prefix,
/// which is added by the connection's framing codec.
pub fn encode_request<R: Request>(
    request: &R,
    version: i16,
    correlation_id: i32,
    client_id: &str,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_header(
        &mut buf,
        R::KEY,
        version,
        R::header_version(version),
        correlation_id,
        client_id,
    )?;
    request
        .encode(&mut buf, version)
        .map_err(|err| encode_error::<R>(version, err))?;

    Ok(buf.freeze())
}

/// Encode only the body of request `R` at `version`.
pub fn encode_body<R: Request>(request: &R, version: i16) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    request
        .encode(&mut buf, version)
        .map_err(|err| encode_error::<R>(version, err))?;
    Ok(buf.freeze())
}

/// Encode a request header with the given `header_version` into `buf`.
pub fn encode_header(
    buf: &mut BytesMut,
    api_key: i16,
    api_version: i16,
    header_version: i16,
    correlation_id: i32,
    client_id: &str,
) -> Result<()> {
    messages::RequestHeader::default()
        .with_request_api_key(api_key)
        .with_request_api_version(api_version)
        .with_correlation_id(correlation_id)
        .with_client_id(Some(StrBytes::from_string(client_id.to_string())))
        .encode(buf, header_version)
        .map_err(|err| Error::CorruptMessage(format!("encoding request header: {err}")))
}

fn encode_error<R: Request>(version: i16, err: impl std::fmt::Display) -> Error {
    Error::CorruptMessage(format!(
        "encoding {} v{version}: {err}",
        std::any::type_name::<R>()
    ))
}

/// Decode the response header of a frame answering `api_key` at `api_version`,
/// returning its correlation id and leaving `frame` positioned at the body.
pub fn decode_response_header(frame: &mut Bytes, api_key: i16, api_version: i16) -> Result<i32> {
    let key = ApiKey::try_from(api_key)
        .map_err(|()| Error::CorruptMessage(format!("invalid API key {api_key}")))?;

    let header = messages::ResponseHeader::decode(frame, key.response_header_version(api_version))
        .map_err(|err| Error::CorruptMessage(format!("decoding response header: {err}")))?;

    Ok(header.correlation_id)
}

/// Strictly decode a response body. Bytes remaining after the body are an error.
pub fn decode_response<R: Request>(mut body: Bytes, version: i16) -> Result<R::Response> {
    let response = R::Response::decode(&mut body, version).map_err(|err| {
        Error::CorruptMessage(format!(
            "decoding {} v{version}: {err}",
            std::any::type_name::<R::Response>()
        ))
    })?;

    if body.has_remaining() {
        return Err(Error::CorruptMessage(format!(
            "{} bytes remain after decoding {} v{version}",
            body.remaining(),
            std::any::type_name::<R::Response>()
        )));
    }
    Ok(response)
}

pub(crate) fn topic_name(name: &str) -> messages::TopicName {
    messages::TopicName(StrBytes::from_string(name.to_string()))
}

pub(crate) fn group_id(id: &str) -> messages::GroupId {
    messages::GroupId(StrBytes::from_string(id.to_string()))
}

pub(crate) fn str_bytes(s: &str) -> StrBytes {
    StrBytes::from_string(s.to_string())
}
