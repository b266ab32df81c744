//! The capability interface every servable model implements, and the payload
//! types flowing through it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::codec;
use crate::error::{DataplaneError, Result};
use crate::infer_type::{InferRequest, InferResponse};

/// Request headers with lower-cased names.
pub type Headers = HashMap<String, String>;

/// Wire protocol a model speaks (for remote handles: the predictor's protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2")]
    V2,
    #[serde(rename = "grpc-v2")]
    GrpcV2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self { Protocol::V1 => "v1", Protocol::V2 => "v2", Protocol::GrpcV2 => "grpc-v2" }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Protocol {
    type Err = DataplaneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v1" => Ok(Protocol::V1),
            "v2" => Ok(Protocol::V2),
            "grpc-v2" => Ok(Protocol::GrpcV2),
            other => Err(DataplaneError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Request payload handed to a model.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// v1 body (`instances` / `inputs` list) or any other JSON document.
    Json(Value),
    /// Typed v2 request, from REST or gRPC.
    Infer(InferRequest),
    /// Non-JSON body, passed through untouched.
    Raw(Vec<u8>),
}

impl Payload {
    /// Typed view of the payload. v1 bodies become a single `input-0` tensor.
    pub fn into_infer_request(self, model_name: &str) -> Result<InferRequest> {
        match self {
            Payload::Infer(r) => Ok(r),
            Payload::Json(v) if InferRequest::is_rest_tensor_body(&v) => InferRequest::from_rest(model_name, &v),
            Payload::Json(v) => codec::v1_to_infer_request(model_name, &v),
            Payload::Raw(_) => Err(DataplaneError::InvalidInput("raw payload has no tensor form".into())),
        }
    }

    /// JSON view: typed requests are rendered as v2 REST bodies.
    pub fn into_json(self) -> Result<Value> {
        match self {
            Payload::Json(v) => Ok(v),
            Payload::Infer(r) => Ok(r.to_rest()),
            Payload::Raw(b) => Ok(serde_json::from_slice(&b)?),
        }
    }
}

/// Response payload returned by a model.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Json(Value),
    Infer(InferResponse),
    Raw(Vec<u8>),
}

impl ResponsePayload {
    pub fn into_json(self) -> Result<Value> {
        match self {
            ResponsePayload::Json(v) => Ok(v),
            ResponsePayload::Infer(r) => Ok(r.to_rest()),
            ResponsePayload::Raw(b) => Ok(serde_json::from_slice(&b)?),
        }
    }

    pub fn into_infer_response(self, model_name: &str, id: &str) -> Result<InferResponse> {
        match self {
            ResponsePayload::Infer(r) => Ok(r),
            ResponsePayload::Json(v) if v.get("outputs").is_some() => InferResponse::from_rest(&v),
            ResponsePayload::Json(v) => codec::v1_to_infer_response(model_name, id, &v),
            ResponsePayload::Raw(_) => Err(DataplaneError::InferenceError("raw response has no tensor form".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorMetadata { pub name: String, pub datatype: String, pub shape: Vec<i64> }

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub versions: Vec<String>,
    pub platform: String,
    pub inputs: Vec<TensorMetadata>,
    pub outputs: Vec<TensorMetadata>,
}

/// A named unit of inference capability. Only `predict` is mandatory; the
/// remaining hooks default to identity or `NotImplemented`.
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    fn ready(&self) -> bool;

    /// Brings the model to the ready state. `Ok(false)` means the model
    /// declined to become ready without a specific error.
    async fn load(&self) -> Result<bool>;

    fn protocol(&self) -> Protocol { Protocol::V1 }

    async fn preprocess(&self, payload: Payload, _headers: &Headers) -> Result<Payload> { Ok(payload) }

    async fn predict(&self, payload: Payload, headers: &Headers) -> Result<ResponsePayload>;

    async fn postprocess(&self, response: ResponsePayload, _headers: &Headers) -> Result<ResponsePayload> { Ok(response) }

    async fn explain(&self, _payload: Payload, _headers: &Headers) -> Result<ResponsePayload> {
        Err(DataplaneError::NotImplemented(format!("Model {} does not support explain", self.name())))
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata { name: self.name().to_string(), versions: vec![], platform: String::new(), inputs: vec![], outputs: vec![] }
    }

    /// Releases held resources. Called before the model leaves the repository.
    async fn stop(&self) {}
}

/// Rejects v1 bodies whose `instances` / `inputs` value is not a list.
pub fn validate(payload: &Payload) -> Result<()> {
    if let Payload::Json(Value::Object(obj)) = payload {
        for key in ["instances", "inputs"] {
            if let Some(v) = obj.get(key) {
                if !v.is_array() { return Err(DataplaneError::InvalidInput(format!("Expected \"{key}\" to be a list"))); }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_non_list() {
        assert!(validate(&Payload::Json(json!({"instances": [[1]]}))).is_ok());
        let err = validate(&Payload::Json(json!({"instances": "x"}))).unwrap_err();
        assert_eq!(err, DataplaneError::InvalidInput("Expected \"instances\" to be a list".into()));
        assert!(validate(&Payload::Json(json!({"inputs": 3}))).is_err());
        assert!(validate(&Payload::Raw(b"abc".to_vec())).is_ok());
    }

    #[test]
    fn protocol_parse() {
        assert_eq!("grpc-v2".parse::<Protocol>().unwrap(), Protocol::GrpcV2);
        assert_eq!("v3".parse::<Protocol>().unwrap_err(), DataplaneError::UnsupportedProtocol("v3".into()));
    }

    #[test]
    fn v1_payload_gets_tensor_view() {
        let req = Payload::Json(json!({"instances": [[1.5, 2.0]]})).into_infer_request("m").unwrap();
        assert_eq!(req.inputs[0].shape, vec![1, 2]);
        let typed = Payload::Json(json!({"inputs": [{"name": "a", "shape": [1], "datatype": "INT32", "data": [4]}]}));
        assert_eq!(typed.into_infer_request("m").unwrap().inputs[0].name, "a");
    }
}
