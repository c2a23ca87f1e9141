use reqwest::blocking::Client;
use reqwest::Method;
use tracing::debug;

use crate::characteristic::CharacteristicValue;
use crate::config::{FanConfig, UrlStyle};
use crate::error::Result;

/// Blocking HTTP adapter for one device API route.
///
/// Requests carry the configured timeout, skip certificate validation and
/// are never retried. Response status codes are not checked.
#[derive(Clone, Debug)]
pub struct DeviceClient {
    http: Client,
    apiroute: String,
    method: Method,
    url_style: UrlStyle,
    auth: Option<(String, String)>,
}

impl DeviceClient {
    pub fn new(config: &FanConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            http,
            apiroute: config.apiroute.trim_end_matches('/').to_string(),
            method: config.method()?,
            url_style: config.url_style,
            auth: config
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
        })
    }

    pub fn status_url(&self) -> String {
        format!("{}/status", self.apiroute)
    }

    pub fn set_url(&self, value: &CharacteristicValue) -> String {
        let endpoint = value.characteristic().set_endpoint();
        match self.url_style {
            UrlStyle::Query => format!("{}/{}?value={}", self.apiroute, endpoint, value),
            UrlStyle::Path => format!("{}/{}/{}", self.apiroute, endpoint, value),
        }
    }

    /// Fetches the raw status body.
    pub fn fetch_status(&self) -> Result<String> {
        self.request(Method::GET, &self.status_url())
    }

    /// Sends one set request for `value` using the configured method.
    pub fn send(&self, value: &CharacteristicValue) -> Result<()> {
        self.request(self.method.clone(), &self.set_url(value))?;
        Ok(())
    }

    fn request(&self, method: Method, url: &str) -> Result<String> {
        let mut request = self.http.request(method, url);
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send()?;
        let status = response.status();
        let body = response.text()?;
        debug!(%url, %status, "device replied");
        Ok(body)
    }
}
