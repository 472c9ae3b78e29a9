//! HTTP hardening applied to the whole router

mod headers;

pub use headers::security_headers_middleware;
