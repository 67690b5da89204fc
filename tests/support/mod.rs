use picshift::config::TransferConfig;
use picshift::storage::JsonFileStorage;
use picshift::test_support::{MockBackend, MockCatalog, MockFetcher, MockPageAgent, MockProbe};
use picshift::transfer::{Collaborators, TransferHandle, TransferService};
use std::path::Path;
use std::sync::Arc;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Mocked collaborators shared across engine restarts
pub struct Mocks {
    pub backend: Arc<MockBackend>,
    pub fetcher: Arc<MockFetcher>,
    pub catalog: Arc<MockCatalog>,
    pub agent: Arc<MockPageAgent>,
    pub probe: Arc<MockProbe>,
}

impl Mocks {
    pub fn new() -> Self {
        Mocks {
            backend: Arc::new(MockBackend::new()),
            fetcher: Arc::new(MockFetcher::new()),
            catalog: Arc::new(MockCatalog::new()),
            agent: Arc::new(MockPageAgent::new()),
            probe: Arc::new(MockProbe::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            backend: self.backend.clone(),
            fetcher: self.fetcher.clone(),
            catalog: self.catalog.clone(),
            agent: self.agent.clone(),
            probe: self.probe.clone(),
        }
    }
}

/// Start an engine persisting into `state_dir`
pub async fn start_engine(state_dir: &Path, mocks: &Mocks) -> TransferHandle {
    let storage = JsonFileStorage::open(state_dir.to_path_buf())
        .await
        .expect("state dir should open");

    TransferService::start(
        tokio::runtime::Handle::current(),
        Arc::new(storage),
        mocks.collaborators(),
        TransferConfig {
            concurrency: 3,
            ..Default::default()
        },
    )
    .await
}
