//! Cloud object storage for caches (`--gocloud-url`)
//!
//! The URL scheme picks the backend (`s3://`, `gs://`, `azblob://` and the
//! other schemes `object_store` understands); the URL path is the object
//! key. Credentials come from the backend's usual environment variables.
//!
//! The helper is otherwise blocking, so each call drives a current-thread
//! tokio runtime to completion.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Read, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutMultipartOpts, WriteMultipart};
use url::Url;

use crate::error::{HelperError, HelperResult};

const CHUNK_SIZE: usize = 5 * 1024 * 1024;
const MAX_CONCURRENT_PARTS: usize = 4;

/// Object named by a gocloud URL.
pub struct Blob {
    store: Box<dyn ObjectStore>,
    path: ObjectPath,
    timeout: Option<Duration>,
}

impl Blob {
    /// Open the bucket behind `raw_url`. `timeout_minutes == 0` means no
    /// overall deadline.
    pub fn open(raw_url: &str, timeout_minutes: u64) -> HelperResult<Self> {
        let url = Url::parse(raw_url)
            .map_err(|e| HelperError::InvalidInput(format!("gocloud url: {e}")))?;
        if url.path().trim_start_matches('/').is_empty() {
            return Err(HelperError::InvalidInput("no object name provided".into()));
        }
        let (store, path) = object_store::parse_url_opts(&url, std::iter::empty::<(String, String)>())?;
        let timeout = (timeout_minutes > 0).then(|| Duration::from_secs(timeout_minutes * 60));
        Ok(Self { store, path, timeout })
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Upload everything `source` yields with `metadata` attached to the
    /// object.
    pub fn upload(&self, source: &mut dyn Read, metadata: &BTreeMap<String, String>) -> HelperResult<()> {
        let mut attributes = Attributes::new();
        for (key, value) in metadata {
            attributes.insert(Attribute::Metadata(key.clone().into()), AttributeValue::from(value.clone()));
        }

        self.block_on(async {
            let opts = PutMultipartOpts {
                attributes,
                ..Default::default()
            };
            let upload = self.store.put_multipart_opts(&self.path, opts).await?;
            let mut writer = WriteMultipart::new_with_chunk_size(upload, CHUNK_SIZE);

            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        writer.abort().await?;
                        return Err(HelperError::Io(e));
                    }
                };
                writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await?;
                writer.write(&buf[..n]);
            }
            writer.finish().await?;
            Ok(())
        })
    }

    /// Modification time of the object.
    pub fn last_modified(&self) -> HelperResult<DateTime<Utc>> {
        self.block_on(async {
            let meta = self.store.head(&self.path).await.map_err(classify)?;
            Ok(meta.last_modified)
        })
    }

    /// Stream the object into `sink`.
    pub fn download_to(&self, sink: &mut dyn Write) -> HelperResult<()> {
        self.block_on(async {
            let result = self.store.get(&self.path).await.map_err(classify)?;
            let mut stream = result.into_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(HelperError::retryable)?;
                sink.write_all(&chunk).map_err(HelperError::retryable)?;
            }
            Ok(())
        })
    }

    fn block_on<T, F>(&self, fut: F) -> HelperResult<T>
    where
        F: Future<Output = HelperResult<T>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| HelperError::retryable(HelperError::Failed("gocloud request timed out".into())))?,
                None => fut.await,
            }
        })
    }
}

/// Missing objects are final; everything else may be transient.
fn classify(err: object_store::Error) -> HelperError {
    match err {
        object_store::Error::NotFound { path, .. } => HelperError::NotFound(path),
        other => HelperError::retryable(other),
    }
}
