//! Aggregated discovery over gRPC: the bidirectional
//! `StreamAggregatedResources` call proxies hold open to the control plane.
//! Each call is bridged onto the session manager's sink and stream, so the
//! protocol state machine is shared with the WebSocket transport.

use futures_util::{future, SinkExt, Stream, StreamExt};
use jetty_proto::discovery::{DiscoveryRequest, DiscoveryResponse};
use jetty_proto::envoy;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::{CancellationToken, PollSender};
use tonic::body::BoxBody;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::{empty_body, http, Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, NamedService, StreamingService};
use tonic::Status;
use tracing::debug;

use crate::coordinator::PushCoordinator;
use crate::session::{SessionError, SessionManager};

/// Responses queued per stream ahead of the HTTP/2 writer.
const RESPONSE_BUFFER: usize = 16;

type ResponseStream = ReceiverStream<Result<envoy::DiscoveryResponse, Status>>;

#[derive(Clone)]
pub struct AggregatedDiscoveryServer {
    coordinator: Arc<PushCoordinator>,
    sessions: Arc<SessionManager>,
    shutdown: CancellationToken,
}

impl AggregatedDiscoveryServer {
    /// Streams end cleanly once `shutdown` fires, so graceful shutdown is not
    /// held open by proxies that never hang up.
    pub fn new(
        coordinator: Arc<PushCoordinator>,
        sessions: Arc<SessionManager>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            sessions,
            shutdown,
        }
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), tonic::transport::Error> {
        let shutdown = self.shutdown.clone();
        tonic::transport::Server::builder()
            .add_service(self)
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
    }

    /// Starts a session for one call and returns the stream of its responses.
    fn open_stream<S>(&self, requests: S) -> ResponseStream
    where
        S: Stream<Item = Result<envoy::DiscoveryRequest, Status>> + Send + 'static,
    {
        let (responses, stream) = mpsc::channel(RESPONSE_BUFFER);
        let coordinator = self.coordinator.clone();
        let sessions = self.sessions.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let tx = PollSender::new(responses)
                .sink_map_err(|_| SessionError::Transport("response stream closed".to_string()))
                .with(|response: DiscoveryResponse| {
                    future::ready(Ok::<_, SessionError>(Ok(envoy::DiscoveryResponse::from(
                        &response,
                    ))))
                });
            let rx = requests
                .map(|request| {
                    request
                        .map(DiscoveryRequest::from)
                        .map_err(|status| SessionError::Transport(status.message().to_string()))
                })
                .take_until(shutdown.cancelled_owned());
            futures_util::pin_mut!(tx);
            futures_util::pin_mut!(rx);

            // Outcome is logged by the session manager.
            let _ = sessions.serve(&coordinator, tx, rx).await;
            debug!("aggregated discovery call finished");
        });
        ReceiverStream::new(stream)
    }
}

struct StreamAggregatedResources(AggregatedDiscoveryServer);

impl StreamingService<envoy::DiscoveryRequest> for StreamAggregatedResources {
    type Response = envoy::DiscoveryResponse;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(
        &mut self,
        request: tonic::Request<Streaming<envoy::DiscoveryRequest>>,
    ) -> Self::Future {
        let responses = self.0.open_stream(request.into_inner());
        Box::pin(future::ready(Ok(tonic::Response::new(responses))))
    }
}

impl<B> Service<http::Request<B>> for AggregatedDiscoveryServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        if request.uri().path() != envoy::STREAM_METHOD_PATH {
            return Box::pin(future::ready(Ok(unimplemented_method())));
        }
        let method = StreamAggregatedResources(self.clone());
        Box::pin(async move {
            let mut grpc = Grpc::new(ProstCodec::default());
            Ok(grpc.streaming(method, request).await)
        })
    }
}

impl NamedService for AggregatedDiscoveryServer {
    const NAME: &'static str = envoy::SERVICE_NAME;
}

fn unimplemented_method() -> http::Response<BoxBody> {
    let mut response = http::Response::new(empty_body());
    let headers = response.headers_mut();
    headers.insert(Status::GRPC_STATUS, (tonic::Code::Unimplemented as i32).into());
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}
