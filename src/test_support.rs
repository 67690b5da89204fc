// Test support utilities for both unit and integration tests

use crate::agent::{AgentError, Catalog, EnumerateError, PageAgent};
use crate::backend::{
    AlbumManifest, ImageMetadata, UploadBackend, UploadDestination, UploadTicketRequest,
};
use crate::network::ReachabilityProbe;
use crate::source::SourceFetcher;
use crate::transfer::{Album, SourceFile, TransferError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source URL the mocks use for `filename`
pub fn source_url(filename: &str) -> String {
    format!("https://source.test/download/{}", filename)
}

pub fn source_file(filename: &str) -> SourceFile {
    SourceFile {
        filename: filename.to_string(),
        file_id: format!("id-{}", filename),
        scene_label: "Ceremony".to_string(),
        source_url: source_url(filename),
    }
}

/// `count` files named `{prefix}-000.jpg`, `{prefix}-001.jpg`, ...
pub fn source_files(prefix: &str, count: usize) -> Vec<SourceFile> {
    (0..count)
        .map(|i| source_file(&format!("{}-{:03}.jpg", prefix, i)))
        .collect()
}

/// Tracks how many calls are in flight at once
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock migration backend
///
/// Issues upload URLs for every file, except files marked as already
/// uploaded (skip) and files whose PUT is scripted to fail.
pub struct MockBackend {
    skipped: Mutex<HashSet<String>>,
    put_errors: Mutex<HashMap<String, TransferError>>,
    metadata_fails: AtomicBool,
    latency: Duration,
    in_flight: Arc<InFlight>,
    tickets: Mutex<Vec<UploadTicketRequest>>,
    puts: Mutex<Vec<String>>,
    metadata: Mutex<Vec<ImageMetadata>>,
    albums: Mutex<Vec<AlbumManifest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_in_flight(Arc::new(InFlight::default()), Duration::ZERO)
    }

    /// Share an in-flight tracker with a fetcher; each PUT takes `latency`
    pub fn with_in_flight(in_flight: Arc<InFlight>, latency: Duration) -> Self {
        MockBackend {
            skipped: Mutex::new(HashSet::new()),
            put_errors: Mutex::new(HashMap::new()),
            metadata_fails: AtomicBool::new(false),
            latency,
            in_flight,
            tickets: Mutex::new(Vec::new()),
            puts: Mutex::new(Vec::new()),
            metadata: Mutex::new(Vec::new()),
            albums: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_uploaded(&self, filename: &str) {
        self.skipped.lock().unwrap().insert(filename.to_string());
    }

    /// Every PUT of `filename` fails with `error`
    pub fn fail_put(&self, filename: &str, error: TransferError) {
        self.put_errors
            .lock()
            .unwrap()
            .insert(filename.to_string(), error);
    }

    pub fn clear_put_failures(&self) {
        self.put_errors.lock().unwrap().clear();
    }

    pub fn fail_metadata(&self) {
        self.metadata_fails.store(true, Ordering::SeqCst);
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.lock().unwrap().len()
    }

    /// Filenames of PUT calls, in call order
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn metadata(&self) -> Vec<ImageMetadata> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn created_albums(&self) -> Vec<AlbumManifest> {
        self.albums.lock().unwrap().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn filename_of(upload_url: &str) -> String {
    upload_url
        .rsplit('/')
        .next()
        .unwrap_or(upload_url)
        .to_string()
}

#[async_trait::async_trait]
impl UploadBackend for MockBackend {
    async fn request_upload_destination(
        &self,
        request: &UploadTicketRequest,
    ) -> Result<UploadDestination, TransferError> {
        self.tickets.lock().unwrap().push(request.clone());

        let object_path = Some(format!("{}/{}", request.album_name, request.filename));
        if self.skipped.lock().unwrap().contains(&request.filename) {
            return Ok(UploadDestination::Skip { object_path });
        }
        Ok(UploadDestination::Upload {
            upload_url: format!(
                "https://bucket.test/upload/{}/{}",
                request.album_id, request.filename
            ),
            object_path,
        })
    }

    async fn put_bytes(&self, upload_url: &str, _data: Vec<u8>) -> Result<(), TransferError> {
        let filename = filename_of(upload_url);
        self.puts.lock().unwrap().push(filename.clone());

        let _guard = self.in_flight.enter();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let error = self.put_errors.lock().unwrap().get(&filename).cloned();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn register_metadata(&self, metadata: &ImageMetadata) -> Result<(), TransferError> {
        if self.metadata_fails.load(Ordering::SeqCst) {
            return Err(TransferError::Rejected("metadata service down".to_string()));
        }
        self.metadata.lock().unwrap().push(metadata.clone());
        Ok(())
    }

    async fn create_album(&self, manifest: &AlbumManifest) -> Result<(), TransferError> {
        self.albums.lock().unwrap().push(manifest.clone());
        Ok(())
    }
}

/// Mock source fetcher with per-URL scripted errors
pub struct MockFetcher {
    scripted: Mutex<HashMap<String, VecDeque<TransferError>>>,
    latency: Duration,
    in_flight: Arc<InFlight>,
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::with_in_flight(Arc::new(InFlight::default()), Duration::ZERO)
    }

    /// Share an in-flight tracker with a backend; each fetch takes `latency`
    pub fn with_in_flight(in_flight: Arc<InFlight>, latency: Duration) -> Self {
        MockFetcher {
            scripted: Mutex::new(HashMap::new()),
            latency,
            in_flight,
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Next fetches of `filename` fail with these errors, in order
    pub fn script(&self, filename: &str, errors: Vec<TransferError>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(source_url(filename), errors.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }

    pub fn fetches_of(&self, filename: &str) -> usize {
        let url = source_url(filename);
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == url)
            .count()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        self.fetched.lock().unwrap().push(url.to_string());

        let _guard = self.in_flight.enter();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|errors| errors.pop_front());
        match scripted {
            Some(error) => Err(error),
            None => Ok(url.as_bytes().to_vec()),
        }
    }
}

/// Mock album catalog
pub struct MockCatalog {
    albums: Mutex<Vec<Album>>,
    files: Mutex<HashMap<String, Vec<SourceFile>>>,
    enumeration_errors: Mutex<HashMap<String, VecDeque<EnumerateError>>>,
    enumerations: Mutex<Vec<String>>,
}

impl MockCatalog {
    pub fn new() -> Self {
        MockCatalog {
            albums: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            enumeration_errors: Mutex::new(HashMap::new()),
            enumerations: Mutex::new(Vec::new()),
        }
    }

    /// Add an album whose file count matches `files`
    pub fn add_album(&self, id: &str, name: &str, files: Vec<SourceFile>) {
        self.albums.lock().unwrap().push(Album {
            id: id.to_string(),
            name: name.to_string(),
            file_count: files.len(),
        });
        self.files.lock().unwrap().insert(id.to_string(), files);
    }

    /// Next enumerations of `album_id` fail with these errors, in order
    pub fn script_enumeration(&self, album_id: &str, errors: Vec<EnumerateError>) {
        self.enumeration_errors
            .lock()
            .unwrap()
            .insert(album_id.to_string(), errors.into());
    }

    /// Album ids passed to `enumerate_files`, in call order
    pub fn enumerations(&self) -> Vec<String> {
        self.enumerations.lock().unwrap().clone()
    }
}

impl Default for MockCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Catalog for MockCatalog {
    async fn list_albums(&self) -> Result<Vec<Album>, AgentError> {
        Ok(self.albums.lock().unwrap().clone())
    }

    async fn enumerate_files(&self, album_id: &str) -> Result<Vec<SourceFile>, EnumerateError> {
        self.enumerations.lock().unwrap().push(album_id.to_string());

        let scripted = self
            .enumeration_errors
            .lock()
            .unwrap()
            .get_mut(album_id)
            .and_then(|errors| errors.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        self.files
            .lock()
            .unwrap()
            .get(album_id)
            .cloned()
            .ok_or_else(|| EnumerateError::Failed(format!("unknown album {}", album_id)))
    }
}

/// Mock page agent; verification answers come from a script, then `false`
pub struct MockPageAgent {
    verify_answers: Mutex<VecDeque<bool>>,
    reloads: AtomicUsize,
    corrective_actions: AtomicUsize,
    verifications: AtomicUsize,
    alerts: Mutex<Vec<String>>,
}

impl MockPageAgent {
    pub fn new() -> Self {
        MockPageAgent {
            verify_answers: Mutex::new(VecDeque::new()),
            reloads: AtomicUsize::new(0),
            corrective_actions: AtomicUsize::new(0),
            verifications: AtomicUsize::new(0),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn script_verify(&self, answers: Vec<bool>) {
        *self.verify_answers.lock().unwrap() = answers.into();
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn corrective_actions(&self) -> usize {
        self.corrective_actions.load(Ordering::SeqCst)
    }

    pub fn verifications(&self) -> usize {
        self.verifications.load(Ordering::SeqCst)
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

impl Default for MockPageAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PageAgent for MockPageAgent {
    async fn reload_page(&self) -> Result<(), AgentError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn trigger_corrective_action(&self) -> Result<(), AgentError> {
        self.corrective_actions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn verify_unblocked(&self, _album_id: &str) -> Result<bool, AgentError> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .verify_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(false))
    }

    async fn show_alert(&self, message: &str) -> Result<(), AgentError> {
        self.alerts.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

/// Reachability probe toggled by the test
pub struct MockProbe {
    reachable: AtomicBool,
    probes: AtomicUsize,
}

impl MockProbe {
    pub fn new() -> Self {
        MockProbe {
            reachable: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for MockProbe {
    async fn is_reachable(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}
