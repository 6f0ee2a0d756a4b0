pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::Serialize;

pub fn empty_response(code: StatusCode) -> Response {
	::http::Response::builder()
		.status(code)
		.body(Body::empty())
		.expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: StatusCode, body: String) -> Response {
	::http::Response::builder()
		.status(code)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(body.into())
		.expect("builder with known status code should not fail")
}

pub fn json_response<T: Serialize>(code: StatusCode, value: &T) -> Response {
	match serde_json::to_vec(value) {
		Ok(buf) => ::http::Response::builder()
			.status(code)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(buf))
			.expect("builder with known status code should not fail"),
		Err(e) => plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

/// Buffers a body fully, up to `limit` bytes. Matching, journaling, and
/// forward retries all need the request at rest.
pub async fn read_body(body: Body, limit: usize) -> anyhow::Result<Bytes> {
	http_body_util::Limited::new(body, limit)
		.collect()
		.await
		.map(|collected| collected.to_bytes())
		.map_err(|e| anyhow::anyhow!("failed to buffer body: {e}"))
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}
