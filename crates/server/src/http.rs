//! HTTP surface.
//!
//! `POST /?address=..&timestamp=..&signature=..[&force]` with a
//! `multipart/form-data` body carrying the CSR in a `csr` file field. The
//! response is the PEM fullchain as an attachment; a cache hit is marked
//! with `x-certificate-cache: <identity key>`. Errors are JSON
//! `{"message": ".."}`.
//!
//! `GET /` answers with a small JSON banner for liveness checks.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Body;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use certgate_common::RequestId;
use certgate_config::Config;

use crate::auth::SignedRequest;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::service::{CertificateService, CertificateSource, ServiceError};
use crate::store::StorageError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Multipart field holding the CSR.
pub const CSR_FIELD: &str = "csr";
/// Response header set when the certificate came from the store.
pub const CACHE_HEADER: &str = "x-certificate-cache";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
const FULLCHAIN_DISPOSITION: &str = "attachment; filename=\"fullchain.pem\"";

/// Room for multipart boundaries and part headers on top of the CSR itself.
const MULTIPART_OVERHEAD_BYTES: usize = 4 * 1024;

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

/// Shared state of every connection.
#[derive(Debug)]
pub struct AppState {
    service: CertificateService,
    rate_limiter: Option<RateLimiter>,
    max_csr_bytes: usize,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        Ok(Self {
            service: CertificateService::new(config)?,
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            max_csr_bytes: config.server.max_csr_bytes,
        })
    }

    fn max_body_bytes(&self) -> usize {
        self.max_csr_bytes + MULTIPART_OVERHEAD_BYTES
    }
}

/// Handle one request from `peer`.
pub async fn handle<B>(
    req: Request<B>,
    peer: SocketAddr,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let request_id = RequestId::new();
    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
        client = %peer.ip(),
    );

    async move {
        let started = Instant::now();
        let mut response = match route(req, peer, &state).await {
            Ok(response) => response,
            Err(err) => {
                let status = err.status();
                if status.is_server_error() {
                    warn!(error = %err, "Request failed");
                } else {
                    debug!(error = %err, "Request rejected");
                }
                error_response(&err)
            }
        };

        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        Ok(response)
    }
    .instrument(span)
    .await
}

async fn route<B>(
    req: Request<B>,
    peer: SocketAddr,
    state: &AppState,
) -> Result<Response<Full<Bytes>>, ServiceError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    if req.uri().path() != "/" {
        return Err(ServiceError::NotFound);
    }

    match *req.method() {
        Method::GET => Ok(json_response(StatusCode::OK, "certgate")),
        Method::POST => {
            if let Some(limiter) = &state.rate_limiter {
                if let RateLimitResult::Limited { retry_after } =
                    limiter.check(peer.ip(), Instant::now())
                {
                    return Err(ServiceError::RateLimited { retry_after });
                }
            }
            request_certificate(req, state).await
        }
        _ => Err(ServiceError::NotFound),
    }
}

async fn request_certificate<B>(
    req: Request<B>,
    state: &AppState,
) -> Result<Response<Full<Bytes>>, ServiceError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let signed = SignedRequest::from_query(req.uri().query())?;

    let (parts, body) = req.into_parts();
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = read_body_with_limit(body, state.max_body_bytes()).await?;
    let csr = extract_csr(content_type.as_deref(), body, state.max_csr_bytes).await?;

    let cert = state
        .service
        .request_certificate(&signed, csr, SystemTime::now())
        .await?;

    let mut response = Response::new(Full::new(Bytes::from(cert.fullchain)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PEM_CONTENT_TYPE));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(FULLCHAIN_DISPOSITION),
    );
    if cert.source == CertificateSource::Cached {
        if let Ok(value) = HeaderValue::from_str(cert.key.as_str()) {
            headers.insert(CACHE_HEADER, value);
        }
    }
    Ok(response)
}

/// Buffer the whole body, failing as soon as it exceeds `limit`.
async fn read_body_with_limit<B>(body: B, limit: usize) -> Result<Bytes, ServiceError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let limited = http_body_util::Limited::new(body, limit);
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            Err(ServiceError::PayloadTooLarge { limit })
        }
        Err(e) => Err(ServiceError::BadRequest(format!("failed to read body: {e}"))),
    }
}

/// Pull the CSR out of a multipart body.
///
/// An empty body means no CSR, which is fine when a cached certificate can
/// be served.
async fn extract_csr(
    content_type: Option<&str>,
    body: Bytes,
    max_csr_bytes: usize,
) -> Result<Option<Bytes>, ServiceError> {
    if body.is_empty() {
        return Ok(None);
    }

    let boundary = content_type
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or_else(|| ServiceError::BadRequest("expected multipart/form-data".to_string()))?;

    let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut csr = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(CSR_FIELD) {
            continue;
        }
        if csr.is_some() {
            return Err(ServiceError::BadRequest(format!(
                "field '{CSR_FIELD}' given more than once"
            )));
        }
        let data = field.bytes().await.map_err(multipart_error)?;
        if data.len() > max_csr_bytes {
            return Err(ServiceError::PayloadTooLarge {
                limit: max_csr_bytes,
            });
        }
        csr = Some(data);
    }

    Ok(csr.filter(|data| !data.is_empty()))
}

fn multipart_error(e: multer::Error) -> ServiceError {
    ServiceError::BadRequest(format!("malformed multipart body: {e}"))
}

fn json_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&MessageBody { message }).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(err: &ServiceError) -> Response<Full<Bytes>> {
    let mut response = json_response(err.status(), &err.client_message());
    if let ServiceError::RateLimited { retry_after } = err {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
    }
    response
}
