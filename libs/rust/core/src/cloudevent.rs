//! CloudEvents 1.0 envelopes around inference bodies.
//!
//! Handling is opt-in: binary mode needs the `ce-specversion`, `ce-id`,
//! `ce-source` and `ce-type` headers, structured mode needs
//! `Content-Type: application/cloudevents+json`. Bodies are never sniffed.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::{json, Map, Value};

use crate::error::{DataplaneError, Result};
use crate::model::{Headers, Payload, ResponsePayload};

pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";
pub const DEFAULT_RESPONSE_TYPE: &str = "io.kserve.inference.response";
pub const SPEC_VERSION: &str = "1.0";

const REQUIRED: [&str; 4] = ["specversion", "id", "source", "type"];
// Context attributes that are never copied as extensions.
const CORE: [&str; 8] = ["specversion", "id", "source", "type", "time", "datacontenttype", "dataschema", "subject"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode { Binary, Structured }

/// Response attribute settings.
#[derive(Debug, Clone, Default)]
pub struct CloudEventOptions {
    /// Defaults to `io.kserve.inference.<model>`.
    pub source: Option<String>,
    /// Defaults to `io.kserve.inference.response`.
    pub event_type: Option<String>,
    /// Copy the request's extension attributes onto the response.
    pub merge: bool,
}

/// What the request envelope carried, kept to re-wrap the response.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub mode: Mode,
    pub id: String,
    pub attributes: BTreeMap<String, String>,
}

impl EventContext {
    pub fn extensions(&self) -> impl Iterator<Item = (&String, &String)> {
        self.attributes.iter().filter(|(k, _)| !CORE.contains(&k.as_str()))
    }
}

pub fn detect(headers: &Headers) -> Option<Mode> {
    if REQUIRED.iter().all(|a| headers.contains_key(&format!("ce-{a}"))) { return Some(Mode::Binary); }
    let structured = headers.get("content-type").map(|ct| ct.trim().to_ascii_lowercase().starts_with(STRUCTURED_CONTENT_TYPE)).unwrap_or(false);
    structured.then_some(Mode::Structured)
}

fn is_json_content_type(ct: Option<&String>) -> bool {
    match ct {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/json") || (ct.starts_with("application/") && ct.contains("+json")) || ct.starts_with("text/json")
        }
    }
}

/// Splits a request into its event context and the logical payload.
pub fn unwrap(mode: Mode, headers: &Headers, body: &[u8]) -> Result<(EventContext, Payload)> {
    match mode {
        Mode::Binary => {
            let attributes: BTreeMap<String, String> = headers
                .iter()
                .filter_map(|(k, v)| k.strip_prefix("ce-").map(|a| (a.to_string(), v.clone())))
                .collect();
            let id = attributes.get("id").cloned().unwrap_or_default();
            let payload = if is_json_content_type(headers.get("content-type")) {
                let v: Value = serde_json::from_slice(body)
                    .map_err(|e| DataplaneError::InvalidInput(format!("Failed to decode or parse binary json cloudevent: {e}")))?;
                Payload::Json(v)
            } else {
                Payload::Raw(body.to_vec())
            };
            Ok((EventContext { mode, id, attributes }, payload))
        }
        Mode::Structured => {
            let envelope: Map<String, Value> = match serde_json::from_slice(body) {
                Ok(Value::Object(m)) => m,
                Ok(_) => return Err(DataplaneError::InvalidInput("structured cloudevent must be a JSON object".into())),
                Err(e) => return Err(DataplaneError::InvalidInput(format!("Failed to decode or parse structured cloudevent: {e}"))),
            };
            for a in REQUIRED {
                if !envelope.contains_key(a) { return Err(DataplaneError::InvalidInput(format!("structured cloudevent is missing attribute \"{a}\""))); }
            }
            let mut attributes = BTreeMap::new();
            for (k, v) in &envelope {
                if k == "data" || k == "data_base64" { continue; }
                let s = match v { Value::String(s) => s.clone(), other => other.to_string() };
                attributes.insert(k.clone(), s);
            }
            let payload = match (envelope.get("data"), envelope.get("data_base64")) {
                (Some(Value::String(s)), _) if is_json_content_type(attributes.get("datacontenttype")) => {
                    // JSON data shipped as a string
                    Payload::Json(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())))
                }
                (Some(v), _) => Payload::Json(v.clone()),
                (None, Some(Value::String(b))) => Payload::Raw(B64.decode(b).map_err(|e| DataplaneError::InvalidInput(format!("invalid data_base64: {e}")))?),
                _ => Payload::Json(Value::Null),
            };
            let id = attributes.get("id").cloned().unwrap_or_default();
            Ok((EventContext { mode, id, attributes }, payload))
        }
    }
}

fn response_attributes(ctx: &EventContext, model_name: &str, opts: &CloudEventOptions) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    if opts.merge {
        for (k, v) in ctx.extensions() { attrs.insert(k.clone(), v.clone()); }
    }
    attrs.insert("specversion".into(), SPEC_VERSION.into());
    attrs.insert("id".into(), ctx.id.clone());
    attrs.insert("source".into(), opts.source.clone().unwrap_or_else(|| format!("io.kserve.inference.{model_name}")));
    attrs.insert("type".into(), opts.event_type.clone().unwrap_or_else(|| DEFAULT_RESPONSE_TYPE.into()));
    attrs.insert("time".into(), chrono::Utc::now().to_rfc3339());
    attrs
}

/// Re-wraps a response in the request's mode, carrying the request's id.
/// Returns the body and the headers to attach.
pub fn wrap(ctx: &EventContext, model_name: &str, response: ResponsePayload, opts: &CloudEventOptions) -> Result<(Vec<u8>, Headers)> {
    let attrs = response_attributes(ctx, model_name, opts);
    let data = match response {
        ResponsePayload::Raw(b) => Err(b),
        other => Ok(other.into_json()?),
    };
    let mut headers = Headers::new();
    match ctx.mode {
        Mode::Binary => {
            for (k, v) in attrs { headers.insert(format!("ce-{k}"), v); }
            let body = match data {
                Ok(v) => { headers.insert("content-type".into(), "application/json".into()); serde_json::to_vec(&v)? }
                Err(b) => { headers.insert("content-type".into(), "application/octet-stream".into()); b }
            };
            Ok((body, headers))
        }
        Mode::Structured => {
            let mut envelope: Map<String, Value> = attrs.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            match data {
                Ok(v) => { envelope.insert("datacontenttype".into(), json!("application/json")); envelope.insert("data".into(), v); }
                Err(b) => { envelope.insert("datacontenttype".into(), json!("application/octet-stream")); envelope.insert("data_base64".into(), json!(B64.encode(b))); }
            }
            headers.insert("content-type".into(), STRUCTURED_CONTENT_TYPE.into());
            Ok((serde_json::to_vec(&Value::Object(envelope))?, headers))
        }
    }
}
