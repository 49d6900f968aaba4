//! Dated artifact storage + single-attempt catalog fetch for LCE.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lce_core::{artifact_name, CatalogDocument, CatalogError, SourceName};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lce-storage";

pub const DEFAULT_CATALOG_ENDPOINT: &str = "https://learn.microsoft.com/api/catalog";
pub const DEFAULT_LOCALE: &str = "en-us";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {name} does not exist in {dir}")]
    Missing { name: String, dir: String },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact {name} is not a valid catalog document")]
    Parse {
        name: String,
        #[source]
        source: CatalogError,
    },
    #[error(transparent)]
    InvalidName(#[from] CatalogError),
}

impl ArtifactError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub name: SourceName,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Flat directory of fetched catalog payloads, one file per fetch date.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_path(&self, name: &SourceName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Store a fetched payload under its dated artifact name.
    pub async fn store_fetched(
        &self,
        fetched_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<StoredArtifact, ArtifactError> {
        let name = SourceName::parse(artifact_name(fetched_at.date_naive()))?;
        self.store_bytes(&name, bytes).await
    }

    /// Write bytes verbatim using an atomic temp-file rename. Identical content
    /// already present under the same name is left untouched.
    pub async fn store_bytes(
        &self,
        name: &SourceName,
        bytes: &[u8],
    ) -> Result<StoredArtifact, ArtifactError> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.artifact_path(name);

        fs::create_dir_all(&self.root).await.map_err(|err| {
            ArtifactError::io(
                format!("creating artifact directory {}", self.root.display()),
                err,
            )
        })?;

        let exists = fs::try_exists(&absolute_path).await.map_err(|err| {
            ArtifactError::io(
                format!("checking artifact path {}", absolute_path.display()),
                err,
            )
        })?;
        if exists {
            let existing = fs::read(&absolute_path).await.map_err(|err| {
                ArtifactError::io(format!("reading {}", absolute_path.display()), err)
            })?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredArtifact {
                    name: name.clone(),
                    content_hash,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                });
            }
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let write_result: Result<(), ArtifactError> = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(|err| {
                    ArtifactError::io(
                        format!("opening temp artifact file {}", temp_path.display()),
                        err,
                    )
                })?;
            file.write_all(bytes).await.map_err(|err| {
                ArtifactError::io(
                    format!("writing temp artifact file {}", temp_path.display()),
                    err,
                )
            })?;
            file.flush().await.map_err(|err| {
                ArtifactError::io(
                    format!("flushing temp artifact file {}", temp_path.display()),
                    err,
                )
            })?;
            drop(file);
            fs::rename(&temp_path, &absolute_path).await.map_err(|err| {
                ArtifactError::io(
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    ),
                    err,
                )
            })
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        Ok(StoredArtifact {
            name: name.clone(),
            content_hash,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    pub async fn read_bytes(&self, name: &SourceName) -> Result<Vec<u8>, ArtifactError> {
        let path = self.artifact_path(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ArtifactError::Missing {
                name: name.to_string(),
                dir: self.root.display().to_string(),
            }),
            Err(err) => Err(ArtifactError::io(format!("reading {}", path.display()), err)),
        }
    }

    pub async fn read_document(&self, name: &SourceName) -> Result<CatalogDocument, ArtifactError> {
        let bytes = self.read_bytes(name).await?;
        CatalogDocument::from_slice(&bytes).map_err(|source| ArtifactError::Parse {
            name: name.to_string(),
            source,
        })
    }

    /// Artifact file names currently in the store, sorted; temp files are skipped.
    pub async fn list(&self) -> Result<Vec<String>, ArtifactError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(ArtifactError::io(
                    format!("listing {}", self.root.display()),
                    err,
                ))
            }
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ArtifactError::io(format!("listing {}", self.root.display()), err))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub use_system_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            use_system_proxy: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub endpoint: String,
    pub locale: String,
}

impl Default for CatalogRequest {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CATALOG_ENDPOINT.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

impl CatalogRequest {
    pub fn params(&self) -> [(&str, &str); 1] {
        [("locale", self.locale.as_str())]
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not a catalog document")]
    InvalidPayload {
        url: String,
        #[source]
        source: CatalogError,
    },
}

/// HTTP client issuing exactly one bounded request per fetch.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        let result: Result<FetchedResponse, FetchError> = async {
            let resp = self.client.get(url).query(params).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            info!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                fetched_at: Utc::now(),
                body,
            })
        }
        .instrument(span)
        .await;
        result
    }

    /// Fetch the catalog and check the body parses as a catalog document;
    /// the returned bytes are the untouched response body.
    pub async fn fetch_catalog(
        &self,
        run_id: Uuid,
        request: &CatalogRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let response = self
            .fetch_bytes(run_id, &request.endpoint, &request.params())
            .await?;
        CatalogDocument::from_slice(&response.body).map_err(|source| FetchError::InvalidPayload {
            url: response.final_url.clone(),
            source,
        })?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn source(name: &str) -> SourceName {
        SourceName::parse(name).expect("source name")
    }

    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.expect("read request");
            let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write response");
            let _ = socket.shutdown().await;
        });
        (format!("http://{addr}/api/catalog"), rx)
    }

    fn test_fetcher(timeout: Duration) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some("lce-test".into()),
            use_system_proxy: false,
        })
        .expect("fetcher")
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn fetched_payload_is_stored_under_dated_name() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join("files"));
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_fetched(fetched_at, br#"{"modules":[]}"#)
            .await
            .expect("first store");
        let second = store
            .store_fetched(fetched_at, br#"{"modules":[]}"#)
            .await
            .expect("second store");

        assert_eq!(first.name.as_str(), "microsoft_learn_catalog_20260224.json");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(
            std::fs::read(&first.absolute_path).expect("read back"),
            br#"{"modules":[]}"#
        );
        assert_eq!(
            store.list().await.expect("list"),
            vec!["microsoft_learn_catalog_20260224.json".to_string()]
        );
    }

    #[tokio::test]
    async fn changed_content_replaces_artifact() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let name = source("batch1.json");

        store.store_bytes(&name, b"{\"a\":[1]}").await.expect("first");
        let replaced = store.store_bytes(&name, b"{\"a\":[2]}").await.expect("second");

        assert!(!replaced.deduplicated);
        let doc = store.read_document(&name).await.expect("read document");
        assert_eq!(doc.collection("a").expect("a").len(), 1);
        assert_eq!(doc.collection("a").expect("a")[0], serde_json::json!(2));
    }

    #[tokio::test]
    async fn missing_artifact_is_reported() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let err = store
            .read_document(&source("nope.json"))
            .await
            .expect_err("missing");
        assert!(matches!(err, ArtifactError::Missing { .. }));
    }

    #[tokio::test]
    async fn fetch_sends_locale_and_returns_body_verbatim() {
        let (url, request_rx) = serve_once("200 OK", r#"{"modules": [{"title": "A"}]}"#).await;
        let request = CatalogRequest {
            endpoint: url,
            locale: "en-us".into(),
        };

        let response = test_fetcher(Duration::from_secs(5))
            .fetch_catalog(Uuid::new_v4(), &request)
            .await
            .expect("fetch");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, br#"{"modules": [{"title": "A"}]}"#);
        let raw_request = request_rx.await.expect("request captured");
        assert!(raw_request.starts_with("GET /api/catalog?locale=en-us "));
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let (url, _rx) = serve_once("503 Service Unavailable", "{}").await;
        let err = test_fetcher(Duration::from_secs(5))
            .fetch_bytes(Uuid::new_v4(), &url, &[])
            .await
            .expect_err("status error");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn non_object_body_is_rejected() {
        let (url, _rx) = serve_once("200 OK", "[1, 2, 3]").await;
        let request = CatalogRequest {
            endpoint: url,
            locale: "en-us".into(),
        };
        let err = test_fetcher(Duration::from_secs(5))
            .fetch_catalog(Uuid::new_v4(), &request)
            .await
            .expect_err("invalid payload");
        assert!(matches!(err, FetchError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn silent_server_hits_the_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let err = test_fetcher(Duration::from_millis(200))
            .fetch_bytes(Uuid::new_v4(), &format!("http://{addr}/"), &[])
            .await
            .expect_err("timeout");
        match err {
            FetchError::Request(inner) => assert!(inner.is_timeout()),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
