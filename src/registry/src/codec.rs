//! Pluggable message codec. The core consumes opaque bytes plus a content
//! type; no producer-side semantics leak past this module.

use crate::error::ForemanError;
use crate::task::TaskMessage;
use serde::{Deserialize, Serialize};

/// The wire codec selected by `task_serializer`.
///
/// `Pickle` is named for configuration-surface parity with the original
/// implementation but is rejected at decode time: there is no idiomatic
/// Rust pickle codec, and accepting the option while silently failing
/// every message would be worse than refusing it up front (see
/// DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    Json,
    Yaml,
    Msgpack,
    Pickle,
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer::Json
    }
}

impl Serializer {
    pub fn content_type(self) -> &'static str {
        match self {
            Serializer::Json => "application/json",
            Serializer::Yaml => "application/x-yaml",
            Serializer::Msgpack => "application/x-msgpack",
            Serializer::Pickle => "application/x-python-serialize",
        }
    }

    /// Decode a raw broker payload into a [`TaskMessage`].
    ///
    /// Malformed payloads become [`ForemanError::Decode`], which the
    /// Listener maps to a reject-without-requeue per the propagation
    /// policy.
    pub fn decode(self, body: &[u8]) -> Result<TaskMessage, ForemanError> {
        match self {
            Serializer::Json => {
                serde_json::from_slice(body).map_err(|e| ForemanError::Decode(e.to_string()))
            }
            Serializer::Yaml => std::str::from_utf8(body)
                .map_err(|e| ForemanError::Decode(e.to_string()))
                .and_then(|s| serde_yaml::from_str(s).map_err(|e| ForemanError::Decode(e.to_string()))),
            Serializer::Msgpack => rmp_serde::from_slice(body)
                .map_err(|e| ForemanError::Decode(e.to_string())),
            Serializer::Pickle => Err(ForemanError::Decode(
                "pickle deserialization is not supported by this worker".into(),
            )),
        }
    }

    pub fn encode(self, message: &TaskMessage) -> Result<Vec<u8>, ForemanError> {
        match self {
            Serializer::Json => {
                serde_json::to_vec(message).map_err(|e| ForemanError::Decode(e.to_string()))
            }
            Serializer::Yaml => {
                serde_yaml::to_string(message)
                    .map(|s| s.into_bytes())
                    .map_err(|e| ForemanError::Decode(e.to_string()))
            }
            Serializer::Msgpack => rmp_serde::to_vec(message)
                .map_err(|e| ForemanError::Decode(e.to_string())),
            Serializer::Pickle => Err(ForemanError::Decode(
                "pickle serialization is not supported by this worker".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trips_name_args_kwargs_eta_retries() {
        let mut msg = TaskMessage::new("add");
        msg.args = vec![serde_json::json!(2), serde_json::json!(3)];
        msg.retries = 2;
        let bytes = Serializer::Json.encode(&msg).unwrap();
        let back = Serializer::Json.decode(&bytes).unwrap();
        assert_eq!(back.name, msg.name);
        assert_eq!(back.args, msg.args);
        assert_eq!(back.retries, msg.retries);
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = Serializer::Json.decode(b"{not json").unwrap_err();
        assert!(matches!(err, ForemanError::Decode(_)));
    }

    #[test]
    fn pickle_is_rejected() {
        assert!(Serializer::Pickle.decode(b"anything").is_err());
    }
}
