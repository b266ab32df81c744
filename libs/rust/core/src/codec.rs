//! Conversions between the v1 (`instances` / `predictions`) JSON shapes and
//! typed v2 tensors.

use serde_json::{json, Value};

use crate::error::{DataplaneError, Result};
use crate::infer_type::{Datatype, InferRequest, InferResponse, InferTensor, TensorData};

/// Name given to the single tensor built from v1 `instances`.
pub const V1_INPUT_NAME: &str = "input-0";
pub const V1_OUTPUT_NAME: &str = "output-0";

/// `{"instances": [...]}` -> one tensor named `input-0`, batch dimension first.
pub fn v1_to_infer_request(model_name: &str, body: &Value) -> Result<InferRequest> {
    let instances = match body.get("instances") {
        Some(v @ Value::Array(_)) => v,
        _ => return Err(DataplaneError::InvalidInput("Expected \"instances\" to be a list".into())),
    };
    let tensor = json_to_tensor(V1_INPUT_NAME, instances)?;
    let mut req = InferRequest::new(model_name, vec![tensor]);
    req.id = body.get("id").and_then(Value::as_str).map(str::to_string);
    Ok(req)
}

/// First input tensor reshaped back into `{"instances": [...]}`.
pub fn infer_request_to_v1(request: &InferRequest) -> Result<Value> {
    let first = request.inputs.first().ok_or_else(|| DataplaneError::InvalidInput("request has no inputs".into()))?;
    Ok(json!({ "instances": reshape(first)? }))
}

/// First output tensor reshaped into `{"predictions": [...]}`.
pub fn infer_response_to_v1(response: &InferResponse) -> Result<Value> {
    let first = response.outputs.first().ok_or_else(|| DataplaneError::InferenceError(format!("model {} returned no outputs", response.model_name)))?;
    Ok(json!({ "predictions": reshape(first)? }))
}

/// `{"predictions": [...]}` from a v1 predictor -> single-output response.
pub fn v1_to_infer_response(model_name: &str, id: &str, body: &Value) -> Result<InferResponse> {
    let predictions = match body.get("predictions") {
        Some(v @ Value::Array(_)) => v,
        _ => return Err(DataplaneError::InferenceError("Expected \"predictions\" to be a list".into())),
    };
    Ok(InferResponse::new(id, model_name, vec![json_to_tensor(V1_OUTPUT_NAME, predictions)?]))
}

/// Builds a tensor from a rectangular nested JSON list, inferring the
/// datatype from its leaves: all booleans BOOL, all integers INT64, any
/// other number FP64, strings BYTES.
pub fn json_to_tensor(name: &str, value: &Value) -> Result<InferTensor> {
    let shape = infer_shape(value);
    check_rectangular(value, &shape)?;
    let datatype = infer_datatype(value)?;
    let data = TensorData::from_json(datatype, value)?;
    InferTensor::new(name, shape.into_iter().map(|d| d as i64).collect(), datatype, data)
}

fn infer_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut cur = value;
    while let Value::Array(items) = cur {
        shape.push(items.len());
        match items.first() { Some(v) => cur = v, None => break }
    }
    shape
}

fn check_rectangular(value: &Value, shape: &[usize]) -> Result<()> {
    match (value, shape.split_first()) {
        (Value::Array(items), Some((n, rest))) => {
            if items.len() != *n { return Err(DataplaneError::InvalidInput("instances are not rectangular".into())); }
            items.iter().try_for_each(|v| check_rectangular(v, rest))
        }
        (Value::Array(_), None) => Err(DataplaneError::InvalidInput("instances are not rectangular".into())),
        (_, Some(_)) => Err(DataplaneError::InvalidInput("instances are not rectangular".into())),
        (_, None) => Ok(()),
    }
}

fn infer_datatype(value: &Value) -> Result<Datatype> {
    fn walk(v: &Value, seen: &mut Option<Datatype>) -> Result<()> {
        let dt = match v {
            Value::Array(items) => return items.iter().try_for_each(|i| walk(i, seen)),
            Value::Bool(_) => Datatype::Bool,
            Value::Number(n) if n.is_i64() => Datatype::Int64,
            Value::Number(_) => Datatype::Fp64,
            Value::String(_) => Datatype::Bytes,
            other => return Err(DataplaneError::InvalidInput(format!("unsupported instance value {other}"))),
        };
        *seen = Some(match (*seen, dt) {
            (None, d) => d,
            (Some(a), b) if a == b => a,
            (Some(Datatype::Int64), Datatype::Fp64) | (Some(Datatype::Fp64), Datatype::Int64) => Datatype::Fp64,
            (Some(a), b) => return Err(DataplaneError::InvalidInput(format!("instances mix {a} and {b} values"))),
        });
        Ok(())
    }
    let mut seen = None;
    walk(value, &mut seen)?;
    // empty list: nothing to infer from
    Ok(seen.unwrap_or(Datatype::Fp64))
}

/// Most empty lists a zero-element tensor may expand into.
const MAX_EMPTY_LISTS: usize = 1 << 16;

/// Nested JSON list following the tensor's shape. A rank-0 tensor yields
/// its single element. Nesting stops at the first zero dimension.
pub fn reshape(tensor: &InferTensor) -> Result<Value> {
    tensor.validate()?;
    if let Some(zero) = tensor.shape.iter().position(|d| *d == 0) {
        let lists = tensor.shape[..zero].iter().fold(1usize, |acc, d| acc.saturating_mul(*d as usize));
        if lists > MAX_EMPTY_LISTS {
            return Err(DataplaneError::InvalidInput(format!("shape {:?} of tensor {} expands to {lists} empty lists", tensor.shape, tensor.name)));
        }
    }
    fn build(data: &TensorData, dims: &[i64], offset: &mut usize) -> Value {
        match dims.split_first() {
            None => {
                let v = data.json_at(*offset).unwrap_or(Value::Null);
                *offset += 1;
                v
            }
            Some((n, rest)) => Value::Array((0..*n).map(|_| build(data, rest, offset)).collect()),
        }
    }
    let mut offset = 0;
    Ok(build(&tensor.data, &tensor.shape, &mut offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_become_int64_tensor() {
        let req = v1_to_infer_request("m", &json!({"instances": [[1, 2], [3, 4], [5, 6]]})).unwrap();
        let t = &req.inputs[0];
        assert_eq!(t.name, "input-0");
        assert_eq!(t.shape, vec![3, 2]);
        assert_eq!(t.datatype, Datatype::Int64);
        assert_eq!(t.data, TensorData::Int64(vec![1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn mixed_numbers_widen_to_fp64() {
        let t = json_to_tensor("x", &json!([1, 2.5])).unwrap();
        assert_eq!(t.datatype, Datatype::Fp64);
        assert_eq!(t.data, TensorData::Fp64(vec![1.0, 2.5]));
    }

    #[test]
    fn ragged_and_mixed_kinds_rejected() {
        assert!(json_to_tensor("x", &json!([[1, 2], [3]])).is_err());
        assert!(json_to_tensor("x", &json!([1, "a"])).is_err());
        let err = v1_to_infer_request("m", &json!({"instances": "nope"})).unwrap_err();
        assert_eq!(err.to_string(), "Expected \"instances\" to be a list");
    }

    #[test]
    fn reshape_restores_nesting() {
        let t = InferTensor::new("o", vec![2, 2], Datatype::Fp32, TensorData::Fp32(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        let resp = InferResponse::new("id", "m", vec![t]);
        assert_eq!(infer_response_to_v1(&resp).unwrap(), json!({"predictions": [[1.0, 2.0], [3.0, 4.0]]}));
    }

    #[test]
    fn predictions_round_trip_through_v2() {
        let body = json!({"predictions": [[1, 2]]});
        let resp = v1_to_infer_response("m", "r1", &body).unwrap();
        assert_eq!(resp.outputs[0].shape, vec![1, 2]);
        assert_eq!(infer_response_to_v1(&resp).unwrap(), body);
    }

    #[test]
    fn zero_sized_shapes_stay_bounded() {
        let t = InferTensor::new("o", vec![2, 0], Datatype::Fp32, TensorData::Fp32(vec![])).unwrap();
        assert_eq!(reshape(&t).unwrap(), json!([[], []]));
        let t = InferTensor::new("o", vec![0, 3], Datatype::Fp32, TensorData::Fp32(vec![])).unwrap();
        assert_eq!(reshape(&t).unwrap(), json!([]));

        let t = InferTensor::new("o", vec![5_000_000, 0], Datatype::Fp32, TensorData::Fp32(vec![])).unwrap();
        let err = reshape(&t).unwrap_err();
        assert!(matches!(err, DataplaneError::InvalidInput(ref m) if m.contains("5000000 empty lists")), "{err}");
    }
}
