//! Blob access for report files.
//!
//! A report's `file_url` is either an `http(s)://` URL or a path relative to
//! the uploads directory. [`BlobResolver`] dispatches between the two.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

/// Readable byte stream for one blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read-mostly access to stored report files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a blob for streaming reads.
    async fn open(&self, location: &str) -> Result<BlobReader>;

    /// Store a new blob and return its location.
    async fn put(
        &self,
        file_name: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String>;

    /// Remove a blob. Missing blobs are not an error.
    async fn remove(&self, location: &str) -> Result<()>;
}

/// Returns true for locations served over HTTP.
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Files under a local uploads directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a location onto a path inside the root.
    ///
    /// Leading separators are ignored; any `..` or prefix component is rejected.
    pub fn resolve(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location.trim_start_matches(['/', '\\']));
        let escapes = relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));

        if escapes || relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath(PathBuf::from(location)));
        }

        Ok(self.root.join(relative))
    }
}

/// Reduce an uploaded file name to a single safe path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn open(&self, location: &str) -> Result<BlobReader> {
        let path = self.resolve(location)?;
        let file = tokio::fs::File::open(&path).await?;
        debug!(path = %path.display(), "Opened local blob");
        Ok(Box::new(file))
    }

    async fn put(
        &self,
        file_name: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        let location = format!(
            "{}-{}",
            uuid::Uuid::new_v4().simple(),
            sanitize_file_name(file_name)
        );
        let path = self.resolve(&location)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let mut file = tokio::fs::File::create(&path).await?;
        let written = match tokio::io::copy(data, &mut file).await {
            Ok(n) => file.flush().await.map(|()| n),
            Err(e) => Err(e),
        };

        match written {
            Ok(bytes) => {
                debug!(path = %path.display(), bytes, "Stored local blob");
                Ok(location)
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %cleanup, "Failed to remove partial blob");
                }
                Err(e.into())
            }
        }
    }

    async fn remove(&self, location: &str) -> Result<()> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blobs fetched over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn open(&self, location: &str) -> Result<BlobReader> {
        let response = self
            .client
            .get(location)
            .send()
            .await?
            .error_for_status()?;

        debug!(url = %location, status = %response.status(), "Opened remote blob");

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn put(
        &self,
        _file_name: &str,
        _data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        Err(StorageError::Unsupported("uploads to remote blob hosts"))
    }

    async fn remove(&self, location: &str) -> Result<()> {
        // Remote blobs belong to the hosting provider; the row is what we own.
        warn!(url = %location, "Remote blob left in place");
        Ok(())
    }
}

/// Routes each location to the local or HTTP store.
#[derive(Debug, Clone)]
pub struct BlobResolver {
    local: LocalBlobStore,
    http: HttpBlobStore,
}

impl BlobResolver {
    pub fn new(local: LocalBlobStore, http: HttpBlobStore) -> Self {
        Self { local, http }
    }

    fn pick(&self, location: &str) -> &dyn BlobStore {
        if is_remote(location) {
            &self.http
        } else {
            &self.local
        }
    }
}

#[async_trait]
impl BlobStore for BlobResolver {
    async fn open(&self, location: &str) -> Result<BlobReader> {
        self.pick(location).open(location).await
    }

    /// New blobs always land in the local uploads directory.
    async fn put(
        &self,
        file_name: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        self.local.put(file_name, data).await
    }

    async fn remove(&self, location: &str) -> Result<()> {
        self.pick(location).remove(location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: BlobReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let store = LocalBlobStore::new("/srv/uploads");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("a/../../b").is_err());
        assert!(store.resolve("").is_err());
        assert_eq!(
            store.resolve("/a.pdf").unwrap(),
            PathBuf::from("/srv/uploads/a.pdf")
        );
    }

    #[tokio::test]
    async fn test_local_open_and_remove() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"alpha").unwrap();
        let store = LocalBlobStore::new(dir.path());

        let bytes = read_all(store.open("a.pdf").await.unwrap()).await;
        assert_eq!(bytes, b"alpha");

        store.remove("a.pdf").await.unwrap();
        assert!(store.open("a.pdf").await.is_err());
        // Removing twice is fine.
        store.remove("a.pdf").await.unwrap();
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("lab 1.pdf"), "lab 1.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\a\\r.docx"), "r.docx");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[tokio::test]
    async fn test_local_put() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("uploads"));

        let mut data: &[u8] = b"delta";
        let location = store.put("../lab.pdf", &mut data).await.unwrap();
        assert!(location.ends_with("-lab.pdf"));
        assert!(!location.contains('/'));

        let bytes = read_all(store.open(&location).await.unwrap()).await;
        assert_eq!(bytes, b"delta");
    }

    #[tokio::test]
    async fn test_local_put_failure_leaves_no_file() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let mut broken = failing_reader();
        let result = store.put("x.pdf", &mut broken).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    fn failing_reader() -> impl AsyncRead + Send + Unpin {
        let chunks: Vec<std::io::Result<&'static [u8]>> = vec![
            Ok(&b"partial"[..]),
            Err(std::io::Error::other("client went away")),
        ];
        StreamReader::new(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_http_open() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/blobs/b.pdf"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(b"bravo".to_vec()))
            .mount(&server)
            .await;

        let store = HttpBlobStore::new(Duration::from_secs(5)).unwrap();
        let bytes = read_all(
            store
                .open(&format!("{}/blobs/b.pdf", server.uri()))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(bytes, b"bravo");
    }

    #[tokio::test]
    async fn test_http_missing_is_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = HttpBlobStore::new(Duration::from_secs(5)).unwrap();
        let result = store.open(&format!("{}/gone.pdf", server.uri())).await;
        assert!(matches!(result, Err(StorageError::Http(_))));
    }

    #[tokio::test]
    async fn test_resolver_dispatch() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("c.pdf"), b"charlie").unwrap();
        let resolver = BlobResolver::new(
            LocalBlobStore::new(dir.path()),
            HttpBlobStore::new(Duration::from_secs(5)).unwrap(),
        );

        assert!(is_remote("https://example.com/x"));
        assert!(!is_remote("c.pdf"));
        let bytes = read_all(resolver.open("c.pdf").await.unwrap()).await;
        assert_eq!(bytes, b"charlie");

        let mut data: &[u8] = b"echo";
        let location = resolver.put("e.pdf", &mut data).await.unwrap();
        assert!(!is_remote(&location));
        assert!(dir.path().join(&location).exists());
    }
}
