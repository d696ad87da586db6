pub type ProxyResponse =
    hyper::Response<http_body_util::combinators::BoxBody<hyper::body::Bytes, hyper::Error>>;
pub type ProxyResult = eyre::Result<ProxyResponse>;

pub fn bytes_to_resp(bytes: Vec<u8>, status: hyper::StatusCode) -> ProxyResponse {
    use http_body_util::BodyExt;

    let mut r = hyper::Response::new(
        http_body_util::Full::new(hyper::body::Bytes::from(bytes))
            .map_err(|e| match e {})
            .boxed(),
    );
    *r.status_mut() = status;
    r
}

/// Plain text error response. The body gets a trailing newline so curl
/// output stays readable.
pub fn error_(status: hyper::StatusCode, msg: String) -> ProxyResponse {
    let mut r = bytes_to_resp(format!("{msg}\n").into_bytes(), status);
    r.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    r
}

pub fn server_error_(m: String) -> ProxyResponse {
    error_(hyper::StatusCode::INTERNAL_SERVER_ERROR, m)
}

pub fn not_found_(m: String) -> ProxyResponse {
    error_(hyper::StatusCode::NOT_FOUND, m)
}

pub fn bad_request_(m: String) -> ProxyResponse {
    error_(hyper::StatusCode::BAD_REQUEST, m)
}

#[macro_export]
macro_rules! server_error {
    ($($t:tt)*) => {{
        $crate::http::server_error_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! not_found {
    ($($t:tt)*) => {{
        $crate::http::not_found_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! bad_request {
    ($($t:tt)*) => {{
        $crate::http::bad_request_(format!($($t)*))
    }};
}
