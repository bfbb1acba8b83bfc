mod client;

pub use client::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
