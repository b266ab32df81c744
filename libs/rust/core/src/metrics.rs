//! Dataplane metrics, registered once in the default prometheus registry.
//!
//! Stage histograms are labelled by `model_name`; the request counter adds
//! an `outcome` label (`ok` or the error kind).

use once_cell::sync::Lazy;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

pub struct DataplaneMetrics {
    pub preprocess_seconds: HistogramVec,
    pub predict_seconds: HistogramVec,
    pub explain_seconds: HistogramVec,
    pub postprocess_seconds: HistogramVec,
    pub requests_total: IntCounterVec,
}

impl DataplaneMetrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            preprocess_seconds: register_histogram_vec!("request_preprocess_seconds", "pre-process request latency", &["model_name"])?,
            predict_seconds: register_histogram_vec!("request_predict_seconds", "predict request latency", &["model_name"])?,
            explain_seconds: register_histogram_vec!("request_explain_seconds", "explain request latency", &["model_name"])?,
            postprocess_seconds: register_histogram_vec!("request_postprocess_seconds", "post-process request latency", &["model_name"])?,
            requests_total: register_int_counter_vec!("inference_requests_total", "Inference requests by model and outcome", &["model_name", "outcome"])?,
        })
    }
}

pub static DATAPLANE_METRICS: Lazy<Option<DataplaneMetrics>> = Lazy::new(|| match DataplaneMetrics::register() {
    Ok(m) => Some(m),
    Err(e) => {
        tracing::warn!(error = %e, "dataplane metrics registration failed");
        None
    }
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage { Preprocess, Predict, Explain, Postprocess }

/// Per-request stage timings in milliseconds, used for the latency log line.
#[derive(Debug, Clone, Default)]
pub struct StageLatencies { pub preprocess_ms: f64, pub predict_ms: f64, pub explain_ms: f64, pub postprocess_ms: f64 }

impl StageLatencies {
    pub fn record(&mut self, model_name: &str, stage: Stage, elapsed: std::time::Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        match stage {
            Stage::Preprocess => self.preprocess_ms = ms,
            Stage::Predict => self.predict_ms = ms,
            Stage::Explain => self.explain_ms = ms,
            Stage::Postprocess => self.postprocess_ms = ms,
        }
        observe_stage(model_name, stage, elapsed.as_secs_f64());
    }
}

pub fn observe_stage(model_name: &str, stage: Stage, secs: f64) {
    let Some(m) = DATAPLANE_METRICS.as_ref() else { return };
    let h = match stage {
        Stage::Preprocess => &m.preprocess_seconds,
        Stage::Predict => &m.predict_seconds,
        Stage::Explain => &m.explain_seconds,
        Stage::Postprocess => &m.postprocess_seconds,
    };
    h.with_label_values(&[model_name]).observe(secs);
}

pub fn count_request(model_name: &str, outcome: &str) {
    if let Some(m) = DATAPLANE_METRICS.as_ref() { m.requests_total.with_label_values(&[model_name, outcome]).inc(); }
}

/// Default registry in text exposition format 0.0.4.
pub fn gather_text() -> String {
    use prometheus::{Encoder, TextEncoder};
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %e, "metrics encode failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
