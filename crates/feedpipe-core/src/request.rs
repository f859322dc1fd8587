use crate::header::HeaderMap;

/// Read-only view of the inbound request.
///
/// The pipeline never mutates a request: it is shared with the spawned
/// producer as `Arc<PipelineRequest>` and consulted when building the
/// per-request transform parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    method: String,
    uri: String,
    headers: HeaderMap,
}

impl PipelineRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers,
        }
    }

    /// A `GET` request with no headers.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri, HeaderMap::new())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The URI without its query string.
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    /// The raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}
