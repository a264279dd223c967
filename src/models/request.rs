use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

use crate::error::{EgressError, Result};

/// An outbound HTTP call classified as login or generic
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Login-class requests count against the per-exit login quota
    pub login: bool,
}

impl OutboundRequest {
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(EgressError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none() {
            return Err(EgressError::InvalidRequest(format!("missing host in {}", url)));
        }

        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            login: false,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self> {
        Self::new(Method::POST, url)
    }

    pub fn login(mut self) -> Self {
        self.login = true;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EgressError::InvalidRequest(format!("header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| EgressError::InvalidRequest(format!("header value: {}", e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .header("content-type", "application/json")?
            .body(body))
    }
}

/// Response of a forwarded call, tagged with the exit that served it
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub exit_index: usize,
    pub exit_name: String,
    /// The call was re-issued through the direct exit
    pub retried_via_direct: bool,
}

impl ForwardResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a final 403 into `Blocked` for callers that treat it as an error
    pub fn error_for_blocked(self) -> Result<Self> {
        if self.status == StatusCode::FORBIDDEN {
            return Err(EgressError::Blocked {
                exit: self.exit_name,
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = OutboundRequest::post("https://auth.example.com/login")
            .unwrap()
            .login()
            .header("x-client", "egress")
            .unwrap()
            .body("user=a");

        assert!(req.login);
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.headers.get("x-client").unwrap(), "egress");
        assert_eq!(req.body, Bytes::from_static(b"user=a"));
    }

    #[test]
    fn test_request_rejects_other_schemes() {
        let err = OutboundRequest::get("ftp://files.example.com/a").unwrap_err();
        assert!(matches!(err, EgressError::UnsupportedScheme(s) if s == "ftp"));
        assert!(matches!(
            OutboundRequest::get("not a url").unwrap_err(),
            EgressError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let req = OutboundRequest::post("http://api.example.com/v1")
            .unwrap()
            .json(&serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(req.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(req.body, Bytes::from_static(br#"{"a":1}"#));
    }

    #[test]
    fn test_blocked_response_maps_to_error() {
        let resp = ForwardResponse {
            status: StatusCode::FORBIDDEN,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            exit_index: 0,
            exit_name: "direct".to_string(),
            retried_via_direct: true,
        };
        assert!(matches!(
            resp.error_for_blocked(),
            Err(EgressError::Blocked { exit }) if exit == "direct"
        ));
    }
}
