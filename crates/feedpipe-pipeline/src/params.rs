//! Per-request transform parameters.

use std::collections::BTreeMap;

use feedpipe_core::{Params, PipelineRequest};

/// Supplies request-specific parameters.
///
/// Implemented for any `Fn(&PipelineRequest) -> Params`.
pub trait ParamSource: Send + Sync {
    fn params(&self, request: &PipelineRequest) -> Params;
}

impl<F> ParamSource for F
where
    F: Fn(&PipelineRequest) -> Params + Send + Sync,
{
    fn params(&self, request: &PipelineRequest) -> Params {
        self(request)
    }
}

/// Build the parameters for one request: static values, then values
/// copied from request headers, then the caller's source. Later layers win.
pub(crate) fn resolve(
    statics: &Params,
    from_headers: &BTreeMap<String, String>,
    source: Option<&dyn ParamSource>,
    request: &PipelineRequest,
) -> Params {
    let mut params = statics.clone();
    for (name, header) in from_headers {
        if let Some(value) = request.header(header) {
            params.insert(name.as_str(), value);
        }
    }
    if let Some(source) = source {
        params.merge(&source.params(request));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedpipe_core::{HeaderMap, ParamValue};

    fn request() -> PipelineRequest {
        let headers: HeaderMap = vec![("X-Tenant-Id", "5821027"), ("x-env", "staging")]
            .into_iter()
            .collect();
        PipelineRequest::new("GET", "/feeds/tenant/5821027", headers)
    }

    #[test]
    fn layers_override_in_order() {
        let statics = Params::new()
            .with("correct_url", "https://feeds.example.com")
            .with("env", "prod");
        let mut from_headers = BTreeMap::new();
        from_headers.insert("tenant_id".to_string(), "x-tenant-id".to_string());
        from_headers.insert("env".to_string(), "x-env".to_string());
        from_headers.insert("missing".to_string(), "x-not-sent".to_string());
        let source = |req: &PipelineRequest| Params::new().with("path", req.path());

        let params = resolve(
            &statics,
            &from_headers,
            Some(&source as &dyn ParamSource),
            &request(),
        );
        assert_eq!(params.get("tenant_id"), Some(&ParamValue::from("5821027")));
        assert_eq!(params.get("env"), Some(&ParamValue::from("staging")));
        assert_eq!(
            params.get("path"),
            Some(&ParamValue::from("/feeds/tenant/5821027"))
        );
        assert_eq!(
            params.get("correct_url"),
            Some(&ParamValue::from("https://feeds.example.com"))
        );
        assert!(params.get("missing").is_none());
    }

    #[test]
    fn no_source_keeps_statics() {
        let statics = Params::new().with("limit", 25);
        let params = resolve(&statics, &BTreeMap::new(), None, &request());
        assert_eq!(params, statics);
    }
}
