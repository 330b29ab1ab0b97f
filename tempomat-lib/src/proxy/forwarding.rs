use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;

use crate::{Error, Result};

pub(crate) type HttpClient = Client<HttpConnector, Incoming>;
pub(crate) type RespBody = BoxBody<bytes::Bytes, hyper::Error>;

/// Normalize the configured backend into a `scheme://authority` prefix
/// the per-request URIs are built on.
pub(crate) fn origin_prefix(backend: &str) -> Result<String> {
    let uri: Uri = backend
        .parse()
        .map_err(|e| Error::InvalidBackend(format!("{backend}: {e}")))?;
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| Error::InvalidBackend(format!("{backend}: missing scheme")))?;
    let authority = uri
        .authority()
        .ok_or_else(|| Error::InvalidBackend(format!("{backend}: missing host")))?;
    Ok(format!("{scheme}://{authority}"))
}

/// Relay a request to the origin. The response body passes through
/// untouched; origin-side HTTP errors are part of that passthrough.
pub(crate) async fn forward(
    req: Request<Incoming>,
    client: &HttpClient,
    origin: &str,
) -> Result<Response<RespBody>> {
    let uri = format!(
        "{}{}",
        origin,
        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    )
    .parse()
    .map_err(|e| Error::Http(format!("invalid upstream uri: {e}")))?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    let out_req = Request::from_parts(parts, body);
    let resp = client
        .request(out_req)
        .await
        .map_err(|e| Error::Http(format!("request failed: {e}")))?;
    Ok(resp.map(|b| b.boxed()))
}

pub(crate) fn empty_body() -> RespBody {
    Full::new(bytes::Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn bad_gateway() -> Response<RespBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

pub(crate) fn service_unavailable() -> Response<RespBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    resp
}
