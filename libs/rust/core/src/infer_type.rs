//! Typed tensor payloads of the open inference protocol and their REST (JSON)
//! and gRPC (protobuf) encodings.
//!
//! A tensor is `name`, `shape`, `datatype`, optional `parameters` and a flat
//! `data` buffer. Element storage follows the protobuf `InferTensorContents`
//! layout so a REST -> gRPC -> REST trip is exact: INT8/16/32 share `i32`
//! storage, UINT8/16/32 share `u32`, FP16 is widened to `f32`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use dataplane_proto::inference as pb;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{DataplaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Datatype { Bool, Uint8, Uint16, Uint32, Uint64, Int8, Int16, Int32, Int64, Fp16, Fp32, Fp64, Bytes }

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Bool => "BOOL",
            Datatype::Uint8 => "UINT8",
            Datatype::Uint16 => "UINT16",
            Datatype::Uint32 => "UINT32",
            Datatype::Uint64 => "UINT64",
            Datatype::Int8 => "INT8",
            Datatype::Int16 => "INT16",
            Datatype::Int32 => "INT32",
            Datatype::Int64 => "INT64",
            Datatype::Fp16 => "FP16",
            Datatype::Fp32 => "FP32",
            Datatype::Fp64 => "FP64",
            Datatype::Bytes => "BYTES",
        }
    }

    /// Width of one element in raw (binary) tensor contents. `None` for BYTES,
    /// which is length-prefixed.
    pub fn raw_size(&self) -> Option<usize> {
        match self {
            Datatype::Bool | Datatype::Uint8 | Datatype::Int8 => Some(1),
            Datatype::Uint16 | Datatype::Int16 | Datatype::Fp16 => Some(2),
            Datatype::Uint32 | Datatype::Int32 | Datatype::Fp32 => Some(4),
            Datatype::Uint64 | Datatype::Int64 | Datatype::Fp64 => Some(8),
            Datatype::Bytes => None,
        }
    }

    fn empty_data(&self) -> TensorData {
        match self {
            Datatype::Bool => TensorData::Bool(vec![]),
            Datatype::Int8 | Datatype::Int16 | Datatype::Int32 => TensorData::Int32(vec![]),
            Datatype::Int64 => TensorData::Int64(vec![]),
            Datatype::Uint8 | Datatype::Uint16 | Datatype::Uint32 => TensorData::Uint32(vec![]),
            Datatype::Uint64 => TensorData::Uint64(vec![]),
            Datatype::Fp16 | Datatype::Fp32 => TensorData::Fp32(vec![]),
            Datatype::Fp64 => TensorData::Fp64(vec![]),
            Datatype::Bytes => TensorData::Bytes(vec![]),
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Datatype {
    type Err = DataplaneError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "BOOL" => Datatype::Bool,
            "UINT8" => Datatype::Uint8,
            "UINT16" => Datatype::Uint16,
            "UINT32" => Datatype::Uint32,
            "UINT64" => Datatype::Uint64,
            "INT8" => Datatype::Int8,
            "INT16" => Datatype::Int16,
            "INT32" => Datatype::Int32,
            "INT64" => Datatype::Int64,
            "FP16" => Datatype::Fp16,
            "FP32" => Datatype::Fp32,
            "FP64" => Datatype::Fp64,
            "BYTES" => Datatype::Bytes,
            other => return Err(DataplaneError::InvalidInput(format!("invalid datatype {other}"))),
        })
    }
}

/// Flat element buffer, one variant per protobuf contents field.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Fp32(Vec<f32>),
    Fp64(Vec<f64>),
    Bytes(Vec<Vec<u8>>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Uint32(v) => v.len(),
            TensorData::Uint64(v) => v.len(),
            TensorData::Fp32(v) => v.len(),
            TensorData::Fp64(v) => v.len(),
            TensorData::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Whether this buffer is the storage used for `dt`.
    pub fn matches(&self, dt: Datatype) -> bool {
        matches!(
            (self, dt),
            (TensorData::Bool(_), Datatype::Bool)
                | (TensorData::Int32(_), Datatype::Int8 | Datatype::Int16 | Datatype::Int32)
                | (TensorData::Int64(_), Datatype::Int64)
                | (TensorData::Uint32(_), Datatype::Uint8 | Datatype::Uint16 | Datatype::Uint32)
                | (TensorData::Uint64(_), Datatype::Uint64)
                | (TensorData::Fp32(_), Datatype::Fp16 | Datatype::Fp32)
                | (TensorData::Fp64(_), Datatype::Fp64)
                | (TensorData::Bytes(_), Datatype::Bytes)
        )
    }

    /// Parses a (possibly nested) JSON list into storage for `dt`.
    pub fn from_json(dt: Datatype, value: &Value) -> Result<Self> {
        let mut leaves = Vec::new();
        flatten_json(value, &mut leaves);
        let bad = |v: &Value| DataplaneError::InvalidInput(format!("invalid value {v} for datatype {dt}"));
        Ok(match dt {
            Datatype::Bool => TensorData::Bool(leaves.iter().map(|v| v.as_bool().ok_or_else(|| bad(v))).collect::<Result<_>>()?),
            Datatype::Int8 | Datatype::Int16 | Datatype::Int32 => {
                let (lo, hi) = match dt { Datatype::Int8 => (i8::MIN as i64, i8::MAX as i64), Datatype::Int16 => (i16::MIN as i64, i16::MAX as i64), _ => (i32::MIN as i64, i32::MAX as i64) };
                TensorData::Int32(leaves.iter().map(|v| v.as_i64().filter(|n| (lo..=hi).contains(n)).map(|n| n as i32).ok_or_else(|| bad(v))).collect::<Result<_>>()?)
            }
            Datatype::Int64 => TensorData::Int64(leaves.iter().map(|v| v.as_i64().ok_or_else(|| bad(v))).collect::<Result<_>>()?),
            Datatype::Uint8 | Datatype::Uint16 | Datatype::Uint32 => {
                let hi = match dt { Datatype::Uint8 => u8::MAX as u64, Datatype::Uint16 => u16::MAX as u64, _ => u32::MAX as u64 };
                TensorData::Uint32(leaves.iter().map(|v| v.as_u64().filter(|n| *n <= hi).map(|n| n as u32).ok_or_else(|| bad(v))).collect::<Result<_>>()?)
            }
            Datatype::Uint64 => TensorData::Uint64(leaves.iter().map(|v| v.as_u64().ok_or_else(|| bad(v))).collect::<Result<_>>()?),
            Datatype::Fp16 | Datatype::Fp32 => TensorData::Fp32(leaves.iter().map(|v| v.as_f64().map(|n| n as f32).ok_or_else(|| bad(v))).collect::<Result<_>>()?),
            Datatype::Fp64 => TensorData::Fp64(leaves.iter().map(|v| v.as_f64().ok_or_else(|| bad(v))).collect::<Result<_>>()?),
            Datatype::Bytes => TensorData::Bytes(leaves.iter().map(|v| v.as_str().map(|s| s.as_bytes().to_vec()).ok_or_else(|| bad(v))).collect::<Result<_>>()?),
        })
    }

    /// Flat JSON list. BYTES elements are rendered as (lossy) UTF-8 strings.
    pub fn to_json(&self) -> Value {
        match self {
            TensorData::Bool(v) => json!(v),
            TensorData::Int32(v) => json!(v),
            TensorData::Int64(v) => json!(v),
            TensorData::Uint32(v) => json!(v),
            TensorData::Uint64(v) => json!(v),
            TensorData::Fp32(v) => json!(v),
            TensorData::Fp64(v) => json!(v),
            TensorData::Bytes(v) => Value::Array(v.iter().map(|b| Value::String(String::from_utf8_lossy(b).into_owned())).collect()),
        }
    }

    /// Element `i` as a JSON scalar.
    pub fn json_at(&self, i: usize) -> Option<Value> {
        Some(match self {
            TensorData::Bool(v) => json!(v.get(i)?),
            TensorData::Int32(v) => json!(v.get(i)?),
            TensorData::Int64(v) => json!(v.get(i)?),
            TensorData::Uint32(v) => json!(v.get(i)?),
            TensorData::Uint64(v) => json!(v.get(i)?),
            TensorData::Fp32(v) => json!(v.get(i)?),
            TensorData::Fp64(v) => json!(v.get(i)?),
            TensorData::Bytes(v) => Value::String(String::from_utf8_lossy(v.get(i)?).into_owned()),
        })
    }

    fn from_contents(dt: Datatype, contents: pb::InferTensorContents) -> Result<Self> {
        Ok(match dt {
            Datatype::Bool => TensorData::Bool(contents.bool_contents),
            Datatype::Int8 | Datatype::Int16 | Datatype::Int32 => TensorData::Int32(contents.int_contents),
            Datatype::Int64 => TensorData::Int64(contents.int64_contents),
            Datatype::Uint8 | Datatype::Uint16 | Datatype::Uint32 => TensorData::Uint32(contents.uint_contents),
            Datatype::Uint64 => TensorData::Uint64(contents.uint64_contents),
            Datatype::Fp32 => TensorData::Fp32(contents.fp32_contents),
            Datatype::Fp64 => TensorData::Fp64(contents.fp64_contents),
            Datatype::Bytes => TensorData::Bytes(contents.bytes_contents),
            Datatype::Fp16 => return Err(DataplaneError::InvalidInput("invalid content type".into())),
        })
    }

    fn to_contents(&self, dt: Datatype) -> Result<pb::InferTensorContents> {
        if dt == Datatype::Fp16 { return Err(DataplaneError::InvalidInput("invalid tensor datatype FP16 for gRPC contents".into())); }
        if !self.matches(dt) { return Err(DataplaneError::InvalidInput(format!("tensor data does not match datatype {dt}"))); }
        let mut c = pb::InferTensorContents::default();
        match self.clone() {
            TensorData::Bool(v) => c.bool_contents = v,
            TensorData::Int32(v) => c.int_contents = v,
            TensorData::Int64(v) => c.int64_contents = v,
            TensorData::Uint32(v) => c.uint_contents = v,
            TensorData::Uint64(v) => c.uint64_contents = v,
            TensorData::Fp32(v) => c.fp32_contents = v,
            TensorData::Fp64(v) => c.fp64_contents = v,
            TensorData::Bytes(v) => c.bytes_contents = v,
        }
        Ok(c)
    }

    /// Decodes little-endian raw contents. BYTES elements are each prefixed
    /// by a 4-byte little-endian length.
    pub fn from_raw(dt: Datatype, raw: &[u8]) -> Result<Self> {
        if let Some(size) = dt.raw_size() {
            if raw.len() % size != 0 {
                return Err(DataplaneError::InvalidInput(format!("raw contents of {} bytes is not a multiple of {size} for datatype {dt}", raw.len())));
            }
        }
        let chunks = |n: usize| raw.chunks_exact(n);
        Ok(match dt {
            Datatype::Bool => TensorData::Bool(raw.iter().map(|b| *b != 0).collect()),
            Datatype::Int8 => TensorData::Int32(raw.iter().map(|b| *b as i8 as i32).collect()),
            Datatype::Int16 => TensorData::Int32(chunks(2).map(|c| i16::from_le_bytes([c[0], c[1]]) as i32).collect()),
            Datatype::Int32 => TensorData::Int32(chunks(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
            Datatype::Int64 => TensorData::Int64(chunks(8).map(|c| i64::from_le_bytes(le8(c))).collect()),
            Datatype::Uint8 => TensorData::Uint32(raw.iter().map(|b| *b as u32).collect()),
            Datatype::Uint16 => TensorData::Uint32(chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]]) as u32).collect()),
            Datatype::Uint32 => TensorData::Uint32(chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
            Datatype::Uint64 => TensorData::Uint64(chunks(8).map(|c| u64::from_le_bytes(le8(c))).collect()),
            Datatype::Fp16 => TensorData::Fp32(chunks(2).map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]]))).collect()),
            Datatype::Fp32 => TensorData::Fp32(chunks(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
            Datatype::Fp64 => TensorData::Fp64(chunks(8).map(|c| f64::from_le_bytes(le8(c))).collect()),
            Datatype::Bytes => {
                let mut out = Vec::new();
                let mut rest = raw;
                while !rest.is_empty() {
                    if rest.len() < 4 { return Err(DataplaneError::InvalidInput("truncated BYTES element length".into())); }
                    let n = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                    rest = &rest[4..];
                    if rest.len() < n { return Err(DataplaneError::InvalidInput("truncated BYTES element".into())); }
                    out.push(rest[..n].to_vec());
                    rest = &rest[n..];
                }
                TensorData::Bytes(out)
            }
        })
    }
}

fn le8(c: &[u8]) -> [u8; 8] { [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]] }

// IEEE 754 half -> single.
fn f16_to_f32(h: u16) -> f32 {
    let sign = ((h >> 15) as u32) << 31;
    let exp = ((h >> 10) & 0x1f) as u32;
    let frac = (h & 0x3ff) as u32;
    let bits = match (exp, frac) {
        (0, 0) => sign,
        (0, _) => {
            // subnormal: renormalise
            let mut e: i32 = -1;
            let mut f = frac;
            while f & 0x400 == 0 { f <<= 1; e += 1; }
            sign | (((127 - 15 - e) as u32) << 23) | ((f & 0x3ff) << 13)
        }
        (0x1f, _) => sign | 0x7f80_0000 | (frac << 13),
        _ => sign | ((exp + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(bits)
}

fn flatten_json<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| flatten_json(v, out)),
        other => out.push(other),
    }
}

/// Request/tensor parameter value (`InferParameter` oneof).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InferParameter { Bool(bool), Int64(i64), String(String) }

pub type Parameters = BTreeMap<String, InferParameter>;

fn params_from_grpc(params: HashMap<String, pb::InferParameter>) -> Parameters {
    use pb::infer_parameter::ParameterChoice;
    params
        .into_iter()
        .filter_map(|(k, v)| {
            let p = match v.parameter_choice? {
                ParameterChoice::BoolParam(b) => InferParameter::Bool(b),
                ParameterChoice::Int64Param(i) => InferParameter::Int64(i),
                ParameterChoice::StringParam(s) => InferParameter::String(s),
            };
            Some((k, p))
        })
        .collect()
}

fn params_to_grpc(params: &Parameters) -> HashMap<String, pb::InferParameter> {
    use pb::infer_parameter::ParameterChoice;
    params
        .iter()
        .map(|(k, v)| {
            let choice = match v {
                InferParameter::Bool(b) => ParameterChoice::BoolParam(*b),
                InferParameter::Int64(i) => ParameterChoice::Int64Param(*i),
                InferParameter::String(s) => ParameterChoice::StringParam(s.clone()),
            };
            (k.clone(), pb::InferParameter { parameter_choice: Some(choice) })
        })
        .collect()
}

fn params_from_json(value: Option<&Value>) -> Result<Parameters> {
    match value {
        None | Some(Value::Null) => Ok(Parameters::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| DataplaneError::InvalidInput(format!("invalid parameters: {e}"))),
    }
}

/// A named tensor. Used for both request inputs and response outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct InferTensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub datatype: Datatype,
    pub parameters: Parameters,
    pub data: TensorData,
}

pub type InferInput = InferTensor;
pub type InferOutput = InferTensor;

impl InferTensor {
    pub fn new(name: impl Into<String>, shape: Vec<i64>, datatype: Datatype, data: TensorData) -> Result<Self> {
        let t = Self { name: name.into(), shape, datatype, parameters: Parameters::new(), data };
        t.validate()?;
        Ok(t)
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self { self.parameters = parameters; self }

    /// Number of elements implied by `shape`.
    pub fn element_count(&self) -> Result<usize> {
        self.shape.iter().try_fold(1usize, |acc, d| {
            if *d < 0 { return Err(DataplaneError::InvalidInput(format!("invalid dimension {d} in shape of tensor {}", self.name))); }
            Ok(acc.saturating_mul(*d as usize))
        })
    }

    /// Checks storage matches the datatype and the shape covers the data.
    pub fn validate(&self) -> Result<()> {
        if !self.data.matches(self.datatype) {
            return Err(DataplaneError::InvalidInput(format!("data of tensor {} does not match datatype {}", self.name, self.datatype)));
        }
        let expected = self.element_count()?;
        if expected != self.data.len() {
            return Err(DataplaneError::InvalidInput(format!(
                "tensor {} has shape {:?} ({expected} elements) but {} data elements",
                self.name, self.shape, self.data.len()
            )));
        }
        Ok(())
    }

    fn from_rest(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| DataplaneError::InvalidInput("tensor must be a JSON object".into()))?;
        let field = |k: &str| obj.get(k).ok_or_else(|| DataplaneError::InvalidInput(format!("tensor is missing required field \"{k}\"")));
        let name = field("name")?.as_str().ok_or_else(|| DataplaneError::InvalidInput("tensor name must be a string".into()))?.to_string();
        let shape: Vec<i64> = serde_json::from_value(field("shape")?.clone()).map_err(|e| DataplaneError::InvalidInput(format!("invalid shape for tensor {name}: {e}")))?;
        let datatype: Datatype = field("datatype")?.as_str().ok_or_else(|| DataplaneError::InvalidInput("datatype must be a string".into()))?.parse()?;
        let data = TensorData::from_json(datatype, field("data")?)?;
        let t = Self { name, shape, datatype, parameters: params_from_json(obj.get("parameters"))?, data };
        t.validate()?;
        Ok(t)
    }

    fn to_rest(&self) -> Value {
        let mut v = json!({
            "name": self.name,
            "shape": self.shape,
            "datatype": self.datatype.as_str(),
            "data": self.data.to_json(),
        });
        if !self.parameters.is_empty() { v["parameters"] = json!(self.parameters); }
        v
    }

    fn from_grpc_parts(
        name: String,
        datatype: &str,
        shape: Vec<i64>,
        parameters: HashMap<String, pb::InferParameter>,
        contents: Option<pb::InferTensorContents>,
        raw: Option<&[u8]>,
    ) -> Result<Self> {
        let datatype: Datatype = datatype.parse()?;
        let data = match (raw, contents) {
            (Some(raw), _) => TensorData::from_raw(datatype, raw)?,
            (None, Some(c)) => TensorData::from_contents(datatype, c)?,
            (None, None) => datatype.empty_data(),
        };
        let t = Self { name, shape, datatype, parameters: params_from_grpc(parameters), data };
        t.validate()?;
        Ok(t)
    }
}

/// Output requested by name in a v2 request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestedOutput { pub name: String, pub parameters: Parameters }

/// InferenceRequest
///
/// ```text
/// { "id": string?, "parameters": {..}?, "inputs": [tensor, ..], "outputs": [{"name"}, ..]? }
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferRequest {
    pub id: Option<String>,
    pub model_name: String,
    pub model_version: Option<String>,
    pub parameters: Parameters,
    pub inputs: Vec<InferInput>,
    pub outputs: Vec<RequestedOutput>,
    pub from_grpc: bool,
}

impl InferRequest {
    pub fn new(model_name: impl Into<String>, inputs: Vec<InferInput>) -> Self {
        Self { model_name: model_name.into(), inputs, ..Default::default() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self { self.id = Some(id.into()); self }

    /// Whether a JSON body has the typed v2 shape (`inputs` is a list of
    /// tensor objects).
    pub fn is_rest_tensor_body(value: &Value) -> bool {
        match value.get("inputs") {
            Some(Value::Array(items)) => items.iter().all(|t| t.get("datatype").is_some() && t.get("shape").is_some()),
            _ => false,
        }
    }

    pub fn from_rest(model_name: &str, value: &Value) -> Result<Self> {
        let inputs = match value.get("inputs") {
            Some(Value::Array(items)) => items.iter().map(InferTensor::from_rest).collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(DataplaneError::InvalidInput("Expected \"inputs\" to be a list".into())),
            None => return Err(DataplaneError::InvalidInput("request is missing \"inputs\"".into())),
        };
        let outputs = match value.get("outputs") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|o| {
                    let name = o.get("name").and_then(Value::as_str).ok_or_else(|| DataplaneError::InvalidInput("requested output is missing \"name\"".into()))?;
                    Ok(RequestedOutput { name: name.to_string(), parameters: params_from_json(o.get("parameters"))? })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(DataplaneError::InvalidInput("Expected \"outputs\" to be a list".into())),
        };
        Ok(Self {
            id: value.get("id").and_then(Value::as_str).map(str::to_string),
            model_name: model_name.to_string(),
            model_version: None,
            parameters: params_from_json(value.get("parameters"))?,
            inputs,
            outputs,
            from_grpc: false,
        })
    }

    pub fn to_rest(&self) -> Value {
        let mut v = json!({ "inputs": self.inputs.iter().map(InferTensor::to_rest).collect::<Vec<_>>() });
        if let Some(id) = &self.id { v["id"] = json!(id); }
        if !self.parameters.is_empty() { v["parameters"] = json!(self.parameters); }
        if !self.outputs.is_empty() {
            v["outputs"] = Value::Array(self.outputs.iter().map(|o| {
                let mut out = json!({ "name": o.name });
                if !o.parameters.is_empty() { out["parameters"] = json!(o.parameters); }
                out
            }).collect());
        }
        v
    }

    pub fn from_grpc(request: pb::ModelInferRequest) -> Result<Self> {
        let raw = &request.raw_input_contents;
        if !raw.is_empty() && raw.len() != request.inputs.len() {
            return Err(DataplaneError::InvalidInput(format!("{} raw input contents for {} inputs", raw.len(), request.inputs.len())));
        }
        let inputs = request
            .inputs
            .into_iter()
            .enumerate()
            .map(|(i, t)| InferTensor::from_grpc_parts(t.name, &t.datatype, t.shape, t.parameters, t.contents, raw.get(i).map(Vec::as_slice)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: Some(request.id).filter(|s| !s.is_empty()),
            model_name: request.model_name,
            model_version: Some(request.model_version).filter(|s| !s.is_empty()),
            parameters: params_from_grpc(request.parameters),
            inputs,
            outputs: request.outputs.into_iter().map(|o| RequestedOutput { name: o.name, parameters: params_from_grpc(o.parameters) }).collect(),
            from_grpc: true,
        })
    }

    pub fn to_grpc(&self) -> Result<pb::ModelInferRequest> {
        let inputs = self
            .inputs
            .iter()
            .map(|t| {
                Ok(pb::model_infer_request::InferInputTensor {
                    name: t.name.clone(),
                    datatype: t.datatype.as_str().to_string(),
                    shape: t.shape.clone(),
                    parameters: params_to_grpc(&t.parameters),
                    contents: Some(t.data.to_contents(t.datatype)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(pb::ModelInferRequest {
            model_name: self.model_name.clone(),
            model_version: self.model_version.clone().unwrap_or_default(),
            id: self.id.clone().unwrap_or_default(),
            parameters: params_to_grpc(&self.parameters),
            inputs,
            outputs: self.outputs.iter().map(|o| pb::model_infer_request::InferRequestedOutputTensor { name: o.name.clone(), parameters: params_to_grpc(&o.parameters) }).collect(),
            raw_input_contents: vec![],
        })
    }

    pub fn input(&self, name: &str) -> Option<&InferInput> { self.inputs.iter().find(|t| t.name == name) }
}

/// InferenceResponse
///
/// ```text
/// { "model_name": string, "model_version": string?, "id": string, "parameters": {..}?, "outputs": [tensor, ..] }
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferResponse {
    pub id: String,
    pub model_name: String,
    pub model_version: Option<String>,
    pub parameters: Parameters,
    pub outputs: Vec<InferOutput>,
    pub from_grpc: bool,
}

impl InferResponse {
    pub fn new(id: impl Into<String>, model_name: impl Into<String>, outputs: Vec<InferOutput>) -> Self {
        Self { id: id.into(), model_name: model_name.into(), outputs, ..Default::default() }
    }

    pub fn from_rest(value: &Value) -> Result<Self> {
        let outputs = match value.get("outputs") {
            Some(Value::Array(items)) => items.iter().map(InferTensor::from_rest).collect::<Result<Vec<_>>>()?,
            _ => return Err(DataplaneError::InvalidInput("Expected \"outputs\" to be a list".into())),
        };
        Ok(Self {
            id: value.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            model_name: value.get("model_name").and_then(Value::as_str).unwrap_or_default().to_string(),
            model_version: value.get("model_version").and_then(Value::as_str).map(str::to_string),
            parameters: params_from_json(value.get("parameters"))?,
            outputs,
            from_grpc: false,
        })
    }

    pub fn to_rest(&self) -> Value {
        let mut v = json!({
            "id": self.id,
            "model_name": self.model_name,
            "outputs": self.outputs.iter().map(InferTensor::to_rest).collect::<Vec<_>>(),
        });
        if let Some(ver) = &self.model_version { v["model_version"] = json!(ver); }
        if !self.parameters.is_empty() { v["parameters"] = json!(self.parameters); }
        v
    }

    pub fn from_grpc(response: pb::ModelInferResponse) -> Result<Self> {
        let raw = &response.raw_output_contents;
        if !raw.is_empty() && raw.len() != response.outputs.len() {
            return Err(DataplaneError::InvalidInput(format!("{} raw output contents for {} outputs", raw.len(), response.outputs.len())));
        }
        let outputs = response
            .outputs
            .into_iter()
            .enumerate()
            .map(|(i, t)| InferTensor::from_grpc_parts(t.name, &t.datatype, t.shape, t.parameters, t.contents, raw.get(i).map(Vec::as_slice)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: response.id,
            model_name: response.model_name,
            model_version: Some(response.model_version).filter(|s| !s.is_empty()),
            parameters: params_from_grpc(response.parameters),
            outputs,
            from_grpc: true,
        })
    }

    pub fn to_grpc(&self) -> Result<pb::ModelInferResponse> {
        let outputs = self
            .outputs
            .iter()
            .map(|t| {
                Ok(pb::model_infer_response::InferOutputTensor {
                    name: t.name.clone(),
                    datatype: t.datatype.as_str().to_string(),
                    shape: t.shape.clone(),
                    parameters: params_to_grpc(&t.parameters),
                    contents: Some(t.data.to_contents(t.datatype)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(pb::ModelInferResponse {
            model_name: self.model_name.clone(),
            model_version: self.model_version.clone().unwrap_or_default(),
            id: self.id.clone(),
            parameters: params_to_grpc(&self.parameters),
            outputs,
            raw_output_contents: vec![],
        })
    }

    /// Keeps only the requested outputs, in request order. No-op when the
    /// request named none. Outputs are untouched on error.
    pub fn retain_requested(&mut self, requested: &[RequestedOutput]) -> Result<()> {
        if requested.is_empty() { return Ok(()); }
        let mut seen = HashSet::with_capacity(requested.len());
        for r in requested {
            if !seen.insert(r.name.as_str()) {
                return Err(DataplaneError::InvalidInput(format!("output {} is requested more than once", r.name)));
            }
            if !self.outputs.iter().any(|o| o.name == r.name) {
                return Err(DataplaneError::InvalidInput(format!("requested output {} is not produced by model {}", r.name, self.model_name)));
            }
        }
        let mut kept = Vec::with_capacity(requested.len());
        for r in requested {
            if let Some(pos) = self.outputs.iter().position(|o| o.name == r.name) {
                kept.push(self.outputs.swap_remove(pos));
            }
        }
        self.outputs = kept;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> InferRequest {
        let a = InferTensor::new("input-0", vec![2, 2], Datatype::Fp32, TensorData::Fp32(vec![0.1, 1.5, -2.0, 3.25])).unwrap();
        let b = InferTensor::new("input-1", vec![3], Datatype::Int8, TensorData::Int32(vec![-1, 0, 7])).unwrap();
        let c = InferTensor::new("input-2", vec![2], Datatype::Bytes, TensorData::Bytes(vec![b"ab".to_vec(), b"".to_vec()])).unwrap();
        let mut req = InferRequest::new("m", vec![a, b, c]).with_id("req-1");
        req.parameters.insert("top_k".into(), InferParameter::Int64(3));
        req
    }

    #[test]
    fn nested_rest_data_is_flattened() {
        let body = json!({"inputs": [{"name": "input-0", "shape": [1, 2], "datatype": "INT32", "data": [[1, 2]]}]});
        let req = InferRequest::from_rest("TestModel", &body).unwrap();
        assert_eq!(req.inputs[0].data, TensorData::Int32(vec![1, 2]));
        assert_eq!(req.inputs[0].shape, vec![1, 2]);
        assert!(req.id.is_none());
    }

    #[test]
    fn shape_mismatch_is_invalid_input() {
        let body = json!({"inputs": [{"name": "x", "shape": [3], "datatype": "FP64", "data": [1.0, 2.0]}]});
        let err = InferRequest::from_rest("m", &body).unwrap_err();
        assert!(matches!(err, DataplaneError::InvalidInput(ref m) if m.contains("3 elements")));
    }

    #[test]
    fn out_of_range_and_unknown_datatype_rejected() {
        let body = json!({"inputs": [{"name": "x", "shape": [1], "datatype": "UINT8", "data": [300]}]});
        assert!(matches!(InferRequest::from_rest("m", &body), Err(DataplaneError::InvalidInput(_))));
        let body = json!({"inputs": [{"name": "x", "shape": [1], "datatype": "COMPLEX", "data": [1]}]});
        assert_eq!(InferRequest::from_rest("m", &body).unwrap_err(), DataplaneError::InvalidInput("invalid datatype COMPLEX".into()));
    }

    #[test]
    fn inputs_not_a_list_rejected() {
        let err = InferRequest::from_rest("m", &json!({"inputs": {"a": 1}})).unwrap_err();
        assert_eq!(err, DataplaneError::InvalidInput("Expected \"inputs\" to be a list".into()));
    }

    #[test]
    fn rest_grpc_rest_round_trip() {
        let req = sample_request();
        let back = InferRequest::from_grpc(req.to_grpc().unwrap()).unwrap();
        assert_eq!(back.inputs, req.inputs);
        assert_eq!(back.id, req.id);
        assert_eq!(back.parameters, req.parameters);
        assert!(back.from_grpc);
        let via_json = InferRequest::from_rest("m", &req.to_rest()).unwrap();
        assert_eq!(via_json.inputs, req.inputs);
    }

    #[test]
    fn response_grpc_round_trip() {
        let out = InferTensor::new("out", vec![1, 3], Datatype::Uint64, TensorData::Uint64(vec![1, 2, u64::MAX])).unwrap();
        let mut resp = InferResponse::new("r1", "m", vec![out]);
        resp.model_version = Some("2".into());
        let back = InferResponse::from_grpc(resp.to_grpc().unwrap()).unwrap();
        assert_eq!(back.outputs, resp.outputs);
        assert_eq!(back.model_version.as_deref(), Some("2"));
        assert_eq!(InferResponse::from_rest(&resp.to_rest()).unwrap().outputs, resp.outputs);
    }

    #[test]
    fn raw_contents_decode_by_datatype() {
        let mut raw = Vec::new();
        for v in [1i32, -2, 3] { raw.extend_from_slice(&v.to_le_bytes()); }
        let req = pb::ModelInferRequest {
            model_name: "m".into(),
            inputs: vec![pb::model_infer_request::InferInputTensor { name: "x".into(), datatype: "INT32".into(), shape: vec![3], ..Default::default() }],
            raw_input_contents: vec![raw],
            ..Default::default()
        };
        let parsed = InferRequest::from_grpc(req).unwrap();
        assert_eq!(parsed.inputs[0].data, TensorData::Int32(vec![1, -2, 3]));

        let mut bytes = Vec::new();
        for s in [&b"hi"[..], &b"there"[..]] { bytes.extend_from_slice(&(s.len() as u32).to_le_bytes()); bytes.extend_from_slice(s); }
        assert_eq!(TensorData::from_raw(Datatype::Bytes, &bytes).unwrap(), TensorData::Bytes(vec![b"hi".to_vec(), b"there".to_vec()]));
        assert!(TensorData::from_raw(Datatype::Fp64, &[0u8; 7]).is_err());
    }

    #[test]
    fn fp16_raw_decodes_and_refuses_typed_contents() {
        // 1.0, -2.0, 0.5 in half precision
        let raw: Vec<u8> = [0x3c00u16, 0xc000, 0x3800].iter().flat_map(|h| h.to_le_bytes()).collect();
        let data = TensorData::from_raw(Datatype::Fp16, &raw).unwrap();
        assert_eq!(data, TensorData::Fp32(vec![1.0, -2.0, 0.5]));
        let t = InferTensor::new("h", vec![3], Datatype::Fp16, data).unwrap();
        assert!(matches!(InferRequest::new("m", vec![t]).to_grpc(), Err(DataplaneError::InvalidInput(_))));
    }

    #[test]
    fn requested_outputs_filter_and_order() {
        let a = InferTensor::new("a", vec![1], Datatype::Bool, TensorData::Bool(vec![true])).unwrap();
        let b = InferTensor::new("b", vec![1], Datatype::Bool, TensorData::Bool(vec![false])).unwrap();
        let c = InferTensor::new("c", vec![1], Datatype::Bool, TensorData::Bool(vec![true])).unwrap();
        let mut resp = InferResponse::new("r", "m", vec![a, b, c]);
        let req = vec![RequestedOutput { name: "c".into(), parameters: Parameters::new() }, RequestedOutput { name: "a".into(), parameters: Parameters::new() }];
        resp.retain_requested(&req).unwrap();
        assert_eq!(resp.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(), vec!["c", "a"]);
        let missing = vec![RequestedOutput { name: "zzz".into(), parameters: Parameters::new() }];
        assert!(resp.retain_requested(&missing).is_err());
    }

    #[test]
    fn duplicate_requested_output_is_rejected() {
        let a = InferTensor::new("a", vec![1], Datatype::Bool, TensorData::Bool(vec![true])).unwrap();
        let b = InferTensor::new("b", vec![1], Datatype::Bool, TensorData::Bool(vec![false])).unwrap();
        let mut resp = InferResponse::new("r", "m", vec![a, b]);
        let twice = vec![RequestedOutput { name: "a".into(), parameters: Parameters::new() }, RequestedOutput { name: "a".into(), parameters: Parameters::new() }];
        assert_eq!(resp.retain_requested(&twice).unwrap_err(), DataplaneError::InvalidInput("output a is requested more than once".into()));
        assert_eq!(resp.outputs.len(), 2);
    }

    #[test]
    fn parameters_survive_json() {
        let body = json!({"parameters": {"flag": true, "n": 4, "s": "x"}, "inputs": [{"name": "x", "shape": [1], "datatype": "BOOL", "data": [true], "parameters": {"content_type": "np"}}]});
        let req = InferRequest::from_rest("m", &body).unwrap();
        assert_eq!(req.parameters.get("flag"), Some(&InferParameter::Bool(true)));
        assert_eq!(req.parameters.get("n"), Some(&InferParameter::Int64(4)));
        assert_eq!(req.inputs[0].parameters.get("content_type"), Some(&InferParameter::String("np".into())));
        assert_eq!(req.to_rest()["parameters"], json!({"flag": true, "n": 4, "s": "x"}));
    }
}
