//! Hedged-read bucket decorator

use super::Bucket;
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::select_ok;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

/// Hedged request tuning.
#[derive(Debug, Clone)]
pub struct HedgedRequestConfig {
    /// Maximum number of extra requests issued for a single read.
    pub up_to: usize,
    /// Delay before each extra request is issued.
    pub delay: Duration,
}

impl Default for HedgedRequestConfig {
    fn default() -> Self {
        Self {
            up_to: 2,
            delay: Duration::from_millis(200),
        }
    }
}

impl HedgedRequestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.up_to == 0 {
            return Err(Error::Config(
                "hedged-request.up-to must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Duplicates `get` requests after a configured delay; first response wins.
///
/// Only reads are hedged — duplicated writes would double mutation traffic
/// for no benefit since single-object writes are already atomic. Use under
/// read tail-latency pressure only.
pub struct HedgedBucket {
    inner: Arc<dyn Bucket>,
    cfg: HedgedRequestConfig,
}

impl HedgedBucket {
    pub fn new(inner: Arc<dyn Bucket>, cfg: HedgedRequestConfig) -> Self {
        Self { inner, cfg }
    }
}

#[async_trait]
impl Bucket for HedgedBucket {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let mut attempts = Vec::with_capacity(self.cfg.up_to + 1);
        for i in 0..=self.cfg.up_to {
            let inner = Arc::clone(&self.inner);
            let key = key.to_string();
            let delay = self.cfg.delay * i as u32;
            attempts.push(
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    inner.get(&key).await
                }
                .boxed(),
            );
        }

        // First Ok wins and cancels the rest; all-failed returns the last error.
        select_ok(attempts).await.map(|(bytes, _)| bytes)
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner.upload(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}
