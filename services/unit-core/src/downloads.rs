//! Grouped artifact downloading.
//!
//! The byte transfer itself belongs to the [`Downloader`] collaborator; this
//! module batches an id-keyed set of requests, drives them concurrently,
//! reports per-item progress, and implements the group-level failure policy:
//! fail-fast cancellation of the whole batch, or independent completion with
//! per-item errors.
//!
//! Cancellation is conveyed to callers through the error *string* (results
//! are persisted inside update plans), so the sentinel below must stay
//! stable across releases.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use convoy_cloudproto::{DownloadPackage, EntityStatus};

/// Sentinel substring identifying an orderly cancellation.
pub const CANCEL_ERROR: &str = "operation canceled";

/// True when an error string conveys cancellation rather than failure.
pub fn is_cancel_error(message: &str) -> bool {
    message.contains(CANCEL_ERROR)
}

/// Artifact kind, used for bulk release after an update terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadTarget {
    Component,
    Service,
    Layer,
}

/// Errors from download orchestration.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("empty URL list for item {0}")]
    EmptyUrls(String),

    #[error("download result for item {0} not found")]
    MissingResult(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{0}")]
    Failed(String),
}

impl DownloadError {
    pub fn is_canceled(&self) -> bool {
        is_cancel_error(&self.to_string())
    }
}

/// Handle for one in-flight transfer.
#[async_trait]
pub trait DownloadHandle: Send {
    /// Path of the (eventually) downloaded file.
    fn file_name(&self) -> String;

    /// Wait for the transfer to finish.
    async fn wait(&mut self) -> Result<(), DownloadError>;
}

/// The byte-transfer collaborator.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Start a transfer. The handle resolves once bytes are on disk; a
    /// fired `cancel` signal resolves it with a cancellation error.
    async fn download(
        &self,
        package: DownloadPackage,
        target: DownloadTarget,
        cancel: watch::Receiver<bool>,
    ) -> Result<Box<dyn DownloadHandle>, DownloadError>;

    /// Release one downloaded file.
    async fn release(&self, path: &str) -> Result<(), DownloadError>;

    /// Release every downloaded file of the given kind.
    async fn release_by_type(&self, target: DownloadTarget) -> Result<(), DownloadError>;
}

/// Per-item outcome of a group download. An empty `error` means success;
/// a cancellation is recognizable via [`is_cancel_error`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub file_name: String,
    #[serde(default)]
    pub error: String,
}

impl DownloadResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_empty()
    }
}

/// Per-item progress callback: `(id, status, error)`.
pub type DownloadNotifier = Arc<dyn Fn(&str, EntityStatus, &str) + Send + Sync>;

/// First non-cancel error in a result set, if any.
pub fn first_download_error(results: &HashMap<String, DownloadResult>) -> Option<String> {
    let mut ids: Vec<_> = results.keys().collect();
    ids.sort();

    ids.into_iter()
        .filter_map(|id| results.get(id))
        .find(|result| !result.error.is_empty() && !is_cancel_error(&result.error))
        .map(|result| result.error.clone())
}

/// Batches downloads over the underlying [`Downloader`].
pub struct GroupDownloader {
    downloader: Arc<dyn Downloader>,
}

impl GroupDownloader {
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self { downloader }
    }

    /// Download every item of `request` concurrently.
    ///
    /// With `continue_on_error` unset, the first failure cancels the rest of
    /// the group; failed items keep their original error while everything
    /// else is marked with the cancellation sentinel. With it set, items
    /// complete independently.
    pub async fn download(
        &self,
        request: HashMap<String, DownloadPackage>,
        target: DownloadTarget,
        continue_on_error: bool,
        notifier: DownloadNotifier,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<String, DownloadResult>, DownloadError> {
        for (id, package) in &request {
            if package.urls.is_empty() {
                return Err(DownloadError::EmptyUrls(id.clone()));
            }
        }

        let mut results: HashMap<String, DownloadResult> = request
            .keys()
            .map(|id| (id.clone(), DownloadResult::default()))
            .collect();

        for id in request.keys() {
            notifier(id, EntityStatus::Downloading, "");
        }

        // Group-local cancellation: fired by the external signal or by the
        // first failure in fail-fast mode.
        let (group_cancel_tx, group_cancel_rx) = watch::channel(false);
        let group_cancel_tx = Arc::new(group_cancel_tx);

        if *cancel.borrow() {
            let _ = group_cancel_tx.send(true);
        }

        let mut waiters = Vec::with_capacity(request.len());

        for (id, package) in request {
            match self
                .downloader
                .download(package, target, group_cancel_rx.clone())
                .await
            {
                Ok(mut handle) => {
                    let file_name = handle.file_name();
                    if let Some(result) = results.get_mut(&id) {
                        result.file_name = file_name;
                    }

                    let cancel_tx = group_cancel_tx.clone();
                    waiters.push(tokio::spawn(async move {
                        let outcome = handle.wait().await;

                        if outcome.is_err() && !continue_on_error {
                            let _ = cancel_tx.send(true);
                        }

                        (id, outcome)
                    }));
                }
                Err(err) => {
                    debug!(id = %id, error = %err, "download enqueue failed");

                    if !err.is_canceled() {
                        let message = err.to_string();
                        if let Some(result) = results.get_mut(&id) {
                            result.error = message.clone();
                        }
                        notifier(&id, EntityStatus::Error, &message);
                    }

                    if !continue_on_error {
                        let _ = group_cancel_tx.send(true);
                        break;
                    }
                }
            }
        }

        // Propagate external cancellation while the group drains.
        let external_pump = {
            let cancel_tx = group_cancel_tx.clone();
            tokio::spawn(async move {
                if cancel.wait_for(|canceled| *canceled).await.is_ok() {
                    let _ = cancel_tx.send(true);
                }
            })
        };

        for joined in futures_util::future::join_all(waiters).await {
            let Ok((id, outcome)) = joined else {
                continue;
            };

            match outcome {
                Ok(()) => notifier(&id, EntityStatus::Downloaded, ""),
                Err(err) if err.is_canceled() => {
                    // Tagged below once the whole group has drained.
                }
                Err(err) => {
                    let message = err.to_string();
                    if let Some(result) = results.get_mut(&id) {
                        result.error = message.clone();
                    }
                    notifier(&id, EntityStatus::Error, &message);
                }
            }
        }

        external_pump.abort();

        if *group_cancel_rx.borrow() {
            debug!("group download canceled");

            for (id, result) in results.iter_mut() {
                if result.error.is_empty() {
                    result.error = DownloadError::Canceled.to_string();
                    notifier(id, EntityStatus::Error, &result.error);
                }
            }
        }

        Ok(results)
    }

    /// Release downloaded firmware artifacts.
    pub async fn release_firmware(&self) {
        if let Err(err) = self.downloader.release_by_type(DownloadTarget::Component).await {
            warn!(error = %err, "can't release downloaded components");
        }
    }

    /// Release downloaded service and layer artifacts.
    pub async fn release_software(&self) {
        if let Err(err) = self.downloader.release_by_type(DownloadTarget::Service).await {
            warn!(error = %err, "can't release downloaded services");
        }

        if let Err(err) = self.downloader.release_by_type(DownloadTarget::Layer).await {
            warn!(error = %err, "can't release downloaded layers");
        }
    }

    /// Ensure every requested id has a result; a lost item is fatal.
    pub fn check_results(
        results: &HashMap<String, DownloadResult>,
        expected: impl Iterator<Item = impl AsRef<str>>,
    ) -> Result<(), DownloadError> {
        for id in expected {
            if !results.contains_key(id.as_ref()) {
                return Err(DownloadError::MissingResult(id.as_ref().to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct TestHandle {
        file_name: String,
        delay: Duration,
        error: Option<String>,
        cancel: watch::Receiver<bool>,
    }

    #[async_trait]
    impl DownloadHandle for TestHandle {
        fn file_name(&self) -> String {
            self.file_name.clone()
        }

        async fn wait(&mut self) -> Result<(), DownloadError> {
            let mut cancel = self.cancel.clone();

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => match &self.error {
                    Some(message) => Err(DownloadError::Failed(message.clone())),
                    None => Ok(()),
                },
                result = cancel.wait_for(|canceled| *canceled) => {
                    if result.is_ok() {
                        Err(DownloadError::Canceled)
                    } else {
                        Ok(())
                    }
                }
            }
        }
    }

    struct TestDownloader {
        delay: Duration,
        error_url: Mutex<Option<(String, String)>>,
    }

    impl TestDownloader {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                error_url: Mutex::new(None),
            }
        }

        fn set_error(&self, url: &str, message: &str) {
            *self.error_url.lock().unwrap() = Some((url.to_string(), message.to_string()));
        }
    }

    #[async_trait]
    impl Downloader for TestDownloader {
        async fn download(
            &self,
            package: DownloadPackage,
            _target: DownloadTarget,
            cancel: watch::Receiver<bool>,
        ) -> Result<Box<dyn DownloadHandle>, DownloadError> {
            let error = self
                .error_url
                .lock()
                .unwrap()
                .as_ref()
                .filter(|(url, _)| package.urls.first() == Some(url))
                .map(|(_, message)| message.clone());

            Ok(Box::new(TestHandle {
                file_name: format!("/tmp/{}", package.urls[0].replace('/', "_")),
                delay: self.delay,
                error,
                cancel,
            }))
        }

        async fn release(&self, _path: &str) -> Result<(), DownloadError> {
            Ok(())
        }

        async fn release_by_type(&self, _target: DownloadTarget) -> Result<(), DownloadError> {
            Ok(())
        }
    }

    fn request(ids: &[&str]) -> HashMap<String, DownloadPackage> {
        ids.iter()
            .map(|id| {
                (
                    id.to_string(),
                    DownloadPackage {
                        urls: vec![format!("https://cloud/{id}")],
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn noop_notifier() -> DownloadNotifier {
        Arc::new(|_, _, _| {})
    }

    #[tokio::test]
    async fn all_items_succeed() {
        let downloader = Arc::new(TestDownloader::new(Duration::from_millis(20)));
        let group = GroupDownloader::new(downloader);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let results = group
            .download(
                request(&["0", "1", "2"]),
                DownloadTarget::Component,
                false,
                noop_notifier(),
                cancel_rx,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.values().all(DownloadResult::succeeded));
        assert!(results.values().all(|r| !r.file_name.is_empty()));
    }

    #[tokio::test]
    async fn fail_fast_cancels_the_rest() {
        let downloader = Arc::new(TestDownloader::new(Duration::from_millis(100)));
        downloader.set_error("https://cloud/1", "download error");
        let group = GroupDownloader::new(downloader);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let results = group
            .download(
                request(&["0", "1", "2"]),
                DownloadTarget::Component,
                false,
                noop_notifier(),
                cancel_rx,
            )
            .await
            .unwrap();

        assert_eq!(results["1"].error, "download error");
        assert!(is_cancel_error(&results["0"].error));
        assert!(is_cancel_error(&results["2"].error));
    }

    #[tokio::test]
    async fn continue_on_error_completes_others() {
        let downloader = Arc::new(TestDownloader::new(Duration::from_millis(20)));
        downloader.set_error("https://cloud/1", "download error");
        let group = GroupDownloader::new(downloader);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let results = group
            .download(
                request(&["0", "1", "2"]),
                DownloadTarget::Layer,
                true,
                noop_notifier(),
                cancel_rx,
            )
            .await
            .unwrap();

        assert!(results["0"].succeeded());
        assert_eq!(results["1"].error, "download error");
        assert!(results["2"].succeeded());
        assert_eq!(
            first_download_error(&results),
            Some("download error".to_string())
        );
    }

    #[tokio::test]
    async fn external_cancel_marks_every_item() {
        let downloader = Arc::new(TestDownloader::new(Duration::from_secs(5)));
        let group = GroupDownloader::new(downloader);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let cancel_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cancel_tx.send(true);
        });

        let results = group
            .download(
                request(&["0", "1", "2"]),
                DownloadTarget::Service,
                true,
                noop_notifier(),
                cancel_rx,
            )
            .await
            .unwrap();

        cancel_task.await.unwrap();

        assert!(results.values().all(|r| is_cancel_error(&r.error)));
        assert_eq!(first_download_error(&results), None);
    }

    #[tokio::test]
    async fn empty_urls_is_a_usage_error() {
        let downloader = Arc::new(TestDownloader::new(Duration::from_millis(10)));
        let group = GroupDownloader::new(downloader);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut bad_request = request(&["0"]);
        bad_request.insert("empty".to_string(), DownloadPackage::default());

        let err = group
            .download(
                bad_request,
                DownloadTarget::Component,
                false,
                noop_notifier(),
                cancel_rx,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::EmptyUrls(id) if id == "empty"));
    }

    #[test]
    fn notifier_sees_per_item_transitions() {
        let seen: Arc<Mutex<Vec<(String, EntityStatus)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let notifier: DownloadNotifier = Arc::new(move |id, status, _| {
            seen_clone.lock().unwrap().push((id.to_string(), status));
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        runtime.block_on(async {
            let downloader = Arc::new(TestDownloader::new(Duration::from_millis(10)));
            let group = GroupDownloader::new(downloader);
            let (_cancel_tx, cancel_rx) = watch::channel(false);

            group
                .download(
                    request(&["a"]),
                    DownloadTarget::Component,
                    false,
                    notifier,
                    cancel_rx,
                )
                .await
                .unwrap();
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("a".to_string(), EntityStatus::Downloading));
        assert_eq!(seen[1], ("a".to_string(), EntityStatus::Downloaded));
    }
}
