use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use http::{header, HeaderValue, Request, Response};
use hyper::body::HttpBody as _;
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use tokio::sync::Mutex;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::classify::{SharedClassifier, StatusInRangeAsFailures};
use tower_http::follow_redirect::{FollowRedirect, FollowRedirectLayer};
use tower_http::set_header::request::SetRequestHeader;
use tower_http::set_header::SetRequestHeaderLayer;
use tower_http::trace::{Trace, TraceLayer};

use crate::error::Result;
use crate::metadata::USER_AGENT;

/// The call-making seam between the registry client and the HTTP stack.
///
/// Authentication plugins implement this trait by wrapping another transport:
/// intercept a `401 Unauthorized` response, obtain credentials for the
/// `WWW-Authenticate` challenge, and replay the request with an
/// `Authorization` header, caching tokens per registry host and scope set.
/// The protocol client itself never inspects authentication state.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>>;
}

type HttpService = Trace<
    SetRequestHeader<
        FollowRedirect<Client<hyper_rustls::HttpsConnector<HttpConnector>>>,
        HeaderValue,
    >,
    SharedClassifier<StatusInRangeAsFailures>,
>;

/// Plain transport over hyper with rustls, redirect following and a
/// User-Agent header.
pub struct HttpTransport {
    service: Arc<Mutex<HttpService>>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let hyper = Client::builder().build::<_, Body>(https);

        let service = ServiceBuilder::new()
            .layer(TraceLayer::new(
                StatusInRangeAsFailures::new(400..=599).into_make_classifier(),
            ))
            .layer(SetRequestHeaderLayer::overriding(
                header::USER_AGENT,
                HeaderValue::from_static(USER_AGENT),
            ))
            .layer(FollowRedirectLayer::new())
            .service(hyper);

        HttpTransport {
            service: Arc::new(Mutex::new(service)),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        log::debug!("sending `{} {}`", request.method(), request.uri());
        let mut service = self.service.lock().await;
        let ready = service.ready().await?;
        let response = ready.call(request).await?;
        log::trace!("received response status `{}`", response.status());
        let (parts, body) = response.into_parts();
        let mut body = Box::pin(body);
        let body = Body::wrap_stream(stream::poll_fn(move |cx| body.as_mut().poll_data(cx)));
        Ok(Response::from_parts(parts, body))
    }
}
