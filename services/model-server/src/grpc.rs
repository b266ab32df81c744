//! gRPC binding of the open inference protocol (`inference.GRPCInferenceService`).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dataplane_core::{DataPlane, DataplaneError, Headers, Protocol, RequestBody, ResponseBody};
use dataplane_proto::inference::{
    grpc_inference_service_server::{GrpcInferenceService, GrpcInferenceServiceServer},
    model_metadata_response::TensorMetadata,
    ModelInferRequest, ModelInferResponse, ModelMetadataRequest, ModelMetadataResponse, ModelReadyRequest, ModelReadyResponse,
    RepositoryModelLoadRequest, RepositoryModelLoadResponse, RepositoryModelUnloadRequest, RepositoryModelUnloadResponse,
    ServerLiveRequest, ServerLiveResponse, ServerMetadataRequest, ServerMetadataResponse, ServerReadyRequest, ServerReadyResponse,
};
use tonic::{Code, Request, Response, Status};
use tracing::{info, instrument};

/// Maps a dataplane failure onto a gRPC status, keeping the message.
pub fn to_status(err: DataplaneError) -> Status {
    let code = match &err {
        DataplaneError::ModelNotFound(_) => Code::NotFound,
        DataplaneError::ModelNotReady { .. } => Code::FailedPrecondition,
        DataplaneError::InvalidInput(_) | DataplaneError::UnsupportedProtocol(_) => Code::InvalidArgument,
        DataplaneError::NotImplemented(_) => Code::Unimplemented,
        DataplaneError::Timeout(_) => Code::DeadlineExceeded,
        DataplaneError::InferenceError(_) | DataplaneError::ModelMissing(_) => Code::Internal,
    };
    Status::new(code, err.to_string())
}

fn metadata_headers<T>(request: &Request<T>) -> Headers {
    request
        .metadata()
        .iter()
        .filter_map(|kv| match kv {
            tonic::metadata::KeyAndValueRef::Ascii(k, v) => v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())),
            tonic::metadata::KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

#[derive(Clone)]
pub struct InferenceService { dataplane: Arc<DataPlane> }

impl InferenceService {
    pub fn new(dataplane: Arc<DataPlane>) -> Self { Self { dataplane } }

    pub fn into_server(self) -> GrpcInferenceServiceServer<Self> { GrpcInferenceServiceServer::new(self) }
}

#[async_trait]
impl GrpcInferenceService for InferenceService {
    async fn server_live(&self, _request: Request<ServerLiveRequest>) -> Result<Response<ServerLiveResponse>, Status> {
        Ok(Response::new(ServerLiveResponse { live: self.dataplane.live() }))
    }

    async fn server_ready(&self, _request: Request<ServerReadyRequest>) -> Result<Response<ServerReadyResponse>, Status> {
        Ok(Response::new(ServerReadyResponse { ready: self.dataplane.ready() }))
    }

    #[instrument(skip(self, request), fields(model.name = %request.get_ref().name))]
    async fn model_ready(&self, request: Request<ModelReadyRequest>) -> Result<Response<ModelReadyResponse>, Status> {
        let ready = self.dataplane.model_ready(&request.get_ref().name).map_err(to_status)?;
        Ok(Response::new(ModelReadyResponse { ready }))
    }

    async fn server_metadata(&self, _request: Request<ServerMetadataRequest>) -> Result<Response<ServerMetadataResponse>, Status> {
        let m = self.dataplane.metadata();
        Ok(Response::new(ServerMetadataResponse { name: m.name, version: m.version, extensions: m.extensions }))
    }

    #[instrument(skip(self, request), fields(model.name = %request.get_ref().name))]
    async fn model_metadata(&self, request: Request<ModelMetadataRequest>) -> Result<Response<ModelMetadataResponse>, Status> {
        let m = self.dataplane.model_metadata(&request.get_ref().name).map_err(to_status)?;
        let tensors = |ts: Vec<dataplane_core::TensorMetadata>| ts.into_iter().map(|t| TensorMetadata { name: t.name, datatype: t.datatype, shape: t.shape }).collect();
        Ok(Response::new(ModelMetadataResponse { name: m.name, versions: m.versions, platform: m.platform, inputs: tensors(m.inputs), outputs: tensors(m.outputs) }))
    }

    #[instrument(skip(self, request), fields(model.name = %request.get_ref().model_name, request.id = %request.get_ref().id))]
    async fn model_infer(&self, request: Request<ModelInferRequest>) -> Result<Response<ModelInferResponse>, Status> {
        let headers = metadata_headers(&request);
        let msg = request.into_inner();
        let name = msg.model_name.clone();
        let outcome = self.dataplane.infer(&name, RequestBody::Grpc(msg), &headers, Protocol::GrpcV2).await.map_err(to_status)?;
        match outcome.body {
            ResponseBody::Grpc(resp) => Ok(Response::new(resp)),
            _ => Err(Status::internal("model produced a non-tensor response")),
        }
    }

    #[instrument(skip(self, request), fields(model.name = %request.get_ref().model_name))]
    async fn repository_model_load(&self, request: Request<RepositoryModelLoadRequest>) -> Result<Response<RepositoryModelLoadResponse>, Status> {
        let name = request.into_inner().model_name;
        self.dataplane.repository_extension().load(&name).await.map_err(to_status)?;
        Ok(Response::new(RepositoryModelLoadResponse { model_name: name, is_loaded: true }))
    }

    #[instrument(skip(self, request), fields(model.name = %request.get_ref().model_name))]
    async fn repository_model_unload(&self, request: Request<RepositoryModelUnloadRequest>) -> Result<Response<RepositoryModelUnloadResponse>, Status> {
        let name = request.into_inner().model_name;
        self.dataplane.repository_extension().unload(&name).await.map_err(to_status)?;
        Ok(Response::new(RepositoryModelUnloadResponse { model_name: name, is_unloaded: true }))
    }
}

pub async fn serve(addr: SocketAddr, service: InferenceService, max_message_bytes: usize, shutdown: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
    info!(target: "model-server.grpc", %addr, "gRPC server listening");
    tonic::transport::Server::builder()
        .add_service(service.into_server().max_decoding_message_size(max_message_bytes))
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}
