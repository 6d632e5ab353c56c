//! Remote certificate retrieval.
//!
//! Fetches a client's registered certificate from its URI. Every fetch is
//! bounded by the configured timeout, and an elapsed timeout is reported as
//! [`CertificateError::Timeout`] rather than a generic failure.

use std::time::Duration;

use super::certificate::CertificateError;
use crate::config::MtlsConfig;

/// Largest accepted response body.
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// HTTP client for certificate URIs.
#[derive(Debug, Clone)]
pub struct CertificateFetcher {
    client: reqwest::Client,
    timeout: Duration,
    allow_http: bool,
}

impl CertificateFetcher {
    /// Creates a fetcher with the given timeout.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::Fetch` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, CertificateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CertificateError::Fetch(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout,
            allow_http: false,
        })
    }

    /// Creates a fetcher from the mTLS configuration.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::Fetch` if the HTTP client cannot be built.
    pub fn from_config(config: &MtlsConfig) -> Result<Self, CertificateError> {
        Self::new(config.certificate_fetch_timeout)
    }

    /// Permits plain `http://` URIs. Intended for local development.
    #[must_use]
    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Fetches the PEM or DER bytes at `url`.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::Timeout` if the request does not finish
    /// in time and `CertificateError::Fetch` for any other failure.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, CertificateError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| CertificateError::Fetch(format!("invalid certificate URI: {e}")))?;
        match parsed.scheme() {
            "https" => {}
            "http" if self.allow_http => {}
            scheme => {
                return Err(CertificateError::Fetch(format!(
                    "certificate URI must use HTTPS, got {scheme}"
                )));
            }
        }

        let timed_out = || CertificateError::Timeout {
            url: url.to_string(),
        };

        let request = async {
            let response = self
                .client
                .get(parsed)
                .header("Accept", "application/pem-certificate-chain, application/pkix-cert")
                .send()
                .await
                .map_err(|e| classify(e, url))?;

            if !response.status().is_success() {
                return Err(CertificateError::Fetch(format!(
                    "certificate fetch returned status {}",
                    response.status()
                )));
            }
            if let Some(len) = response.content_length()
                && len as usize > MAX_RESPONSE_SIZE
            {
                return Err(CertificateError::Fetch(
                    "certificate response exceeds maximum size".into(),
                ));
            }

            let body = response.bytes().await.map_err(|e| classify(e, url))?;
            if body.len() > MAX_RESPONSE_SIZE {
                return Err(CertificateError::Fetch(
                    "certificate response exceeds maximum size".into(),
                ));
            }
            Ok(body.to_vec())
        };

        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(url = %url, timeout = ?self.timeout, "Certificate fetch timed out");
                Err(timed_out())
            }
        }
    }
}

fn classify(error: reqwest::Error, url: &str) -> CertificateError {
    if error.is_timeout() {
        tracing::warn!(url = %url, "Certificate fetch timed out");
        CertificateError::Timeout {
            url: url.to_string(),
        }
    } else {
        tracing::warn!(url = %url, error = %error, "Certificate fetch failed");
        CertificateError::Fetch(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::certificate::tests::{CLIENT_A, CLIENT_A_S256, validator};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_fetcher(timeout: Duration) -> CertificateFetcher {
        CertificateFetcher {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .no_proxy()
                .build()
                .unwrap(),
            timeout,
            allow_http: true,
        }
    }

    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/x-pem-file\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/client.pem")
    }

    #[tokio::test]
    async fn test_fetch_certificate() {
        let url = serve_once(CLIENT_A).await;
        let fetcher = local_fetcher(Duration::from_secs(5));

        let bytes = fetcher.fetch(&url).await.unwrap();
        let info = validator().parse(&bytes).into_result().unwrap();
        assert_eq!(info.thumbprint_sha256, CLIENT_A_S256);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let fetcher = local_fetcher(Duration::from_millis(200));
        let err = fetcher
            .fetch(&format!("http://{addr}/slow.pem"))
            .await
            .unwrap_err();
        assert!(matches!(err, CertificateError::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_http_rejected_by_default() {
        let fetcher = CertificateFetcher::new(Duration::from_secs(1)).unwrap();
        let err = fetcher.fetch("http://example.com/c.pem").await.unwrap_err();
        assert!(matches!(err, CertificateError::Fetch(_)));

        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err, CertificateError::Fetch(_)));
    }
}
