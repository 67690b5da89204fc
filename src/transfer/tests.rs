use crate::agent::EnumerateError;
use crate::config::TransferConfig;
use crate::storage::MemoryStorage;
use crate::test_support::{
    source_files, InFlight, MockBackend, MockCatalog, MockFetcher, MockPageAgent, MockProbe,
};
use crate::transfer::{
    AlbumRef, BatchError, BatchRequest, ChallengeTrigger, Collaborators, CommandError,
    PauseReason, RecoveryOutcome, RecoveryPhase, RetryRequest, StateError, TransferError,
    TransferHandle, TransferService, TransferStatus, TransitionError,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    handle: TransferHandle,
    backend: Arc<MockBackend>,
    fetcher: Arc<MockFetcher>,
    catalog: Arc<MockCatalog>,
    agent: Arc<MockPageAgent>,
    probe: Arc<MockProbe>,
    in_flight: Arc<InFlight>,
}

async fn harness(concurrency: usize, latency: Duration) -> Harness {
    let in_flight = Arc::new(InFlight::default());
    let backend = Arc::new(MockBackend::with_in_flight(in_flight.clone(), latency));
    let fetcher = Arc::new(MockFetcher::with_in_flight(in_flight.clone(), latency));
    let catalog = Arc::new(MockCatalog::new());
    let agent = Arc::new(MockPageAgent::new());
    let probe = Arc::new(MockProbe::new());

    let collaborators = Collaborators {
        backend: backend.clone(),
        fetcher: fetcher.clone(),
        catalog: catalog.clone(),
        agent: agent.clone(),
        probe: probe.clone(),
    };
    let config = TransferConfig {
        concurrency,
        ..Default::default()
    };

    let handle = TransferService::start(
        tokio::runtime::Handle::current(),
        Arc::new(MemoryStorage::new()),
        collaborators,
        config,
    )
    .await;

    Harness {
        handle,
        backend,
        fetcher,
        catalog,
        agent,
        probe,
        in_flight,
    }
}

fn album(id: &str) -> AlbumRef {
    AlbumRef {
        id: id.to_string(),
        name: format!("Album {}", id),
    }
}

fn batch_request() -> BatchRequest {
    BatchRequest {
        domain: Some("studio".to_string()),
        delay_ms: 0,
        selection: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_completed_matches_outcomes_in_every_snapshot() {
    let h = harness(3, Duration::from_millis(50)).await;
    h.catalog.add_album("A", "Album A", source_files("a", 8));
    h.backend
        .fail_put("a-002.jpg", TransferError::Rejected("HTTP 500".to_string()));
    h.backend
        .fail_put("a-005.jpg", TransferError::Rejected("HTTP 500".to_string()));

    let mut rx = h.handle.subscribe();
    let watcher = tokio::spawn(async move {
        let mut seen = 0;
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            assert_eq!(
                state.completed,
                state.successes.len() + state.failures.len()
            );
            seen += 1;
            if state.status == TransferStatus::Halted {
                break;
            }
        }
        seen
    });

    let started = h
        .handle
        .start_single(album("A"), 8, Some("studio".to_string()), 0)
        .await
        .unwrap();
    let log = started.handle.await.unwrap().unwrap();

    assert!(watcher.await.unwrap() > 0);
    assert_eq!(log.successful, 6);
    assert_eq!(log.failed, 2);

    // Permanent errors stop at the retry ceiling
    assert_eq!(h.fetcher.fetches_of("a-002.jpg"), 3);

    let ledger = h.handle.ledger().await.unwrap();
    assert_eq!(ledger.len(), 2);
    assert!(ledger.iter().all(|e| e.album_id == "A"));
}

#[tokio::test(start_paused = true)]
async fn test_skip_response_transfers_no_bytes() {
    let h = harness(2, Duration::ZERO).await;
    let files = source_files("s", 4);
    for file in &files {
        h.backend.mark_uploaded(&file.filename);
    }
    h.catalog.add_album("S", "Album S", files);

    let started = h.handle.start_single(album("S"), 4, None, 0).await.unwrap();
    let log = started.handle.await.unwrap().unwrap();

    assert_eq!(log.successful, 4);
    assert_eq!(h.fetcher.fetch_count(), 0);
    assert!(h.backend.puts().is_empty());

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.completed, 4);
    assert!(snapshot.successes.iter().all(|s| s.skipped));
}

#[tokio::test(start_paused = true)]
async fn test_user_pause_stops_new_fetches_and_puts() {
    let h = harness(2, Duration::from_secs(1)).await;
    h.catalog.add_album("P", "Album P", source_files("p", 6));

    let started = h.handle.start_single(album("P"), 6, None, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let paused = h.handle.pause().await.unwrap();
    assert_eq!(paused.paused_reason(), Some(PauseReason::User));

    // Let calls already in flight drain
    tokio::time::sleep(Duration::from_secs(5)).await;
    let fetches = h.fetcher.fetch_count();
    let puts = h.backend.puts().len();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.fetcher.fetch_count(), fetches);
    assert_eq!(h.backend.puts().len(), puts);
    assert!(h.handle.snapshot().paused());

    h.handle.resume().await.unwrap();
    let log = started.handle.await.unwrap().unwrap();
    assert_eq!(log.successful, 6);
}

#[tokio::test(start_paused = true)]
async fn test_resume_rejected_while_offline() {
    let h = harness(1, Duration::from_secs(1)).await;
    h.catalog.add_album("R", "Album R", source_files("r", 3));

    let started = h.handle.start_single(album("R"), 3, None, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.handle.pause().await.unwrap();

    h.probe.set_reachable(false);
    assert_eq!(
        h.handle.resume().await.unwrap_err(),
        CommandError::NetworkUnreachable
    );
    assert_eq!(
        h.handle.snapshot().paused_reason(),
        Some(PauseReason::User)
    );

    h.probe.set_reachable(true);
    h.handle.resume().await.unwrap();
    let log = started.handle.await.unwrap().unwrap();
    assert_eq!(log.successful, 3);
}

#[tokio::test(start_paused = true)]
async fn test_network_loss_pauses_and_heals_without_resume() {
    let h = harness(2, Duration::from_secs(1)).await;
    h.catalog.add_album("N", "Album N", source_files("n", 6));

    let started = h.handle.start_single(album("N"), 6, None, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The next barrier check after the in-flight fetch and put pauses
    h.probe.set_reachable(false);
    let in_flight_attempt = Duration::from_secs(2);
    let mut paused_rx = h.handle.subscribe();
    tokio::time::timeout(
        TransferConfig::default().network_poll + in_flight_attempt,
        paused_rx.wait_for(|s| s.paused_reason() == Some(PauseReason::Network)),
    )
    .await
    .expect("network loss should pause within one poll interval")
    .unwrap();

    h.probe.set_reachable(true);
    let mut rx = h.handle.subscribe();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| !s.paused()))
        .await
        .expect("network pause should clear within one poll")
        .unwrap();

    let log = started.handle.await.unwrap().unwrap();
    assert_eq!(log.successful, 6);
}

#[tokio::test(start_paused = true)]
async fn test_challenge_resolves_on_third_cycle() {
    let h = harness(2, Duration::ZERO).await;
    h.catalog.add_album("C", "Album C", source_files("c", 3));
    h.fetcher.script(
        "c-000.jpg",
        vec![TransferError::Blocked("HTTP 403".to_string())],
    );
    h.agent.script_verify(vec![false, false, true]);

    let started = h.handle.start_single(album("C"), 3, None, 0).await.unwrap();
    let log = started.handle.await.unwrap().unwrap();

    assert_eq!(log.successful, 3);
    assert_eq!(log.failed, 0);
    assert_eq!(h.agent.verifications(), 3);
    assert_eq!(h.agent.reloads(), 3);
    assert_eq!(h.agent.corrective_actions(), 3);
    assert!(h.agent.alerts().is_empty());
    assert_eq!(*h.handle.recovery_phase().borrow(), RecoveryPhase::Resolved);
}

#[tokio::test(start_paused = true)]
async fn test_hard_block_exhaustion_waits_for_operator() {
    let h = harness(2, Duration::ZERO).await;
    h.catalog.add_album("H", "Album H", source_files("h", 2));
    h.fetcher.script(
        "h-000.jpg",
        vec![TransferError::Blocked("HTTP 429".to_string())],
    );

    let started = h.handle.start_single(album("H"), 2, None, 0).await.unwrap();
    tokio::time::sleep(Duration::from_secs(90)).await;

    let snapshot = h.handle.snapshot();
    assert!(snapshot.running());
    assert_eq!(snapshot.paused_reason(), Some(PauseReason::User));
    assert_eq!(h.agent.alerts().len(), 1);
    assert_eq!(h.agent.verifications(), 3);
    assert_eq!(*h.handle.recovery_phase().borrow(), RecoveryPhase::Exhausted);
    assert!(!started.handle.is_finished());

    h.handle.resume().await.unwrap();
    let log = started.handle.await.unwrap().unwrap();
    assert_eq!(log.successful, 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_items_exhaustion_skips_album() {
    let h = harness(2, Duration::ZERO).await;
    h.catalog.add_album("Z", "Album Z", source_files("z", 3));
    h.catalog.add_album("Y", "Album Y", source_files("y", 2));
    h.catalog
        .script_enumeration("Z", vec![EnumerateError::ZeroItems]);

    let started = h.handle.start_batch(batch_request()).await.unwrap();
    let summary = started.handle.await.unwrap().unwrap();

    assert_eq!(h.catalog.enumerations(), vec!["Z", "Y"]);
    assert_eq!(summary.albums.len(), 2);
    assert_eq!(summary.albums[0].successful, 0);
    assert_eq!(summary.albums[0].failed, 0);
    assert_eq!(summary.albums[1].successful, 2);
    assert_eq!(h.fetcher.fetches_of("z-000.jpg"), 0);
    assert!(h.agent.alerts().is_empty());
    assert_eq!(h.agent.verifications(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_empty_recovery_re_enumerates() {
    let h = harness(2, Duration::ZERO).await;
    h.catalog.add_album("M", "Album M", source_files("m", 3));
    h.catalog
        .script_enumeration("M", vec![EnumerateError::MetadataEmpty]);
    h.agent.script_verify(vec![true]);

    let started = h.handle.start_single(album("M"), 3, None, 0).await.unwrap();
    let log = started.handle.await.unwrap().unwrap();

    assert_eq!(h.catalog.enumerations(), vec!["M", "M"]);
    assert_eq!(log.successful, 3);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_empty_exhaustion_holds_batch_until_resume() {
    let h = harness(2, Duration::ZERO).await;
    h.catalog.add_album("M", "Album M", source_files("m", 3));
    h.catalog.add_album("Y", "Album Y", source_files("y", 2));
    h.catalog
        .script_enumeration("M", vec![EnumerateError::MetadataEmpty]);

    let started = h.handle.start_batch(batch_request()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(90)).await;

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.album_id.as_deref(), Some("M"));
    assert_eq!(snapshot.paused_reason(), Some(PauseReason::User));
    assert_eq!(h.agent.alerts().len(), 1);
    assert_eq!(h.agent.verifications(), 3);
    assert_eq!(h.catalog.enumerations(), vec!["M"]);
    assert_eq!(h.fetcher.fetch_count(), 0);
    assert!(!started.handle.is_finished());

    h.handle.resume().await.unwrap();
    let summary = started.handle.await.unwrap().unwrap();

    assert_eq!(h.catalog.enumerations(), vec!["M", "M", "Y"]);
    assert_eq!(summary.albums.len(), 2);
    assert_eq!(summary.albums[0].successful, 3);
    assert_eq!(summary.albums[1].successful, 2);
    assert_eq!(h.agent.alerts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_items_report_mid_album_halts_album_and_batch_moves_on() {
    let h = harness(1, Duration::from_secs(1)).await;
    h.catalog.add_album("Z", "Album Z", source_files("z", 10));
    h.catalog.add_album("Y", "Album Y", source_files("y", 2));

    let mut rx = h.handle.subscribe();
    let halted = tokio::spawn(async move {
        rx.wait_for(|s| s.album_id.as_deref() == Some("Z") && s.status == TransferStatus::Halted)
            .await
            .map(|s| s.clone())
    });

    let started = h.handle.start_batch(batch_request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let recovery = h
        .handle
        .report_challenge(ChallengeTrigger::ZeroItems)
        .expect("recovery should start");
    let summary = started.handle.await.unwrap().unwrap();

    assert_eq!(recovery.await.unwrap(), RecoveryOutcome::SkippedAlbum);
    let halted = halted.await.unwrap().unwrap();
    assert!(halted.completed < 10);
    assert!(h.agent.alerts().is_empty());

    // Files past the one in flight were never attempted
    assert_eq!(h.fetcher.fetches_of("z-009.jpg"), 0);
    assert_eq!(summary.albums.len(), 2);
    assert_eq!(summary.albums[0].album_id, "Z");
    assert_eq!(summary.albums[0].failed, 0);
    assert_eq!(summary.albums[0].successful, halted.completed);
    assert_eq!(summary.albums[1].successful, 2);
}

#[tokio::test(start_paused = true)]
async fn test_bulk_retry_runs_only_failed_files_per_album() {
    let h = harness(2, Duration::ZERO).await;
    h.catalog.add_album("A", "Album A", source_files("a", 3));
    h.catalog.add_album("B", "Album B", source_files("b", 2));
    h.catalog.add_album("C", "Album C", source_files("c", 2));
    h.backend
        .fail_put("a-001.jpg", TransferError::Rejected("HTTP 500".to_string()));
    h.backend
        .fail_put("b-000.jpg", TransferError::Rejected("HTTP 500".to_string()));

    let started = h.handle.start_batch(batch_request()).await.unwrap();
    let summary = started.handle.await.unwrap().unwrap();
    assert_eq!(summary.total_files, 7);
    assert_eq!(summary.successful, 5);
    assert_eq!(summary.total_failed, 2);

    h.backend.clear_put_failures();
    let tickets_before = h.backend.ticket_count();
    let enumerations_before = h.catalog.enumerations().len();

    let retry = h
        .handle
        .retry_failed(RetryRequest::default())
        .await
        .unwrap();
    assert_eq!(retry.groups.len(), 2);
    let retried = retry.handle.await.unwrap().unwrap();

    assert_eq!(retried.albums.len(), 2);
    assert_eq!(retried.albums[0].album_id, "A");
    assert_eq!(retried.albums[0].total_files, 1);
    assert_eq!(retried.albums[1].album_id, "B");
    assert_eq!(retried.albums[1].total_files, 1);
    assert_eq!(retried.successful, 2);
    assert_eq!(retried.total_failed, 0);
    assert_eq!(retried.domain.as_deref(), Some("studio"));

    assert_eq!(h.backend.ticket_count() - tickets_before, 2);
    assert_eq!(
        h.catalog.enumerations()[enumerations_before..].to_vec(),
        vec!["A", "B"]
    );

    let last_run = h.handle.last_run().await.unwrap().unwrap();
    assert!(last_run.failures().is_empty());
    assert_eq!(
        h.handle
            .retry_failed(RetryRequest::default())
            .await
            .err(),
        Some(CommandError::Batch(BatchError::NoFailedFiles))
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound() {
    let h = harness(3, Duration::from_millis(200)).await;
    h.catalog.add_album("K", "Album K", source_files("k", 10));

    let started = h.handle.start_single(album("K"), 10, None, 0).await.unwrap();
    let log = started.handle.await.unwrap().unwrap();

    assert_eq!(log.successful, 10);
    assert!(h.in_flight.max() <= 3);
    assert!(h.in_flight.max() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_do_not_consume_retries() {
    let h = harness(1, Duration::ZERO).await;
    h.catalog.add_album("T", "Album T", source_files("t", 1));
    h.fetcher.script(
        "t-000.jpg",
        (0..5)
            .map(|_| TransferError::Network("connection reset".to_string()))
            .collect(),
    );

    let started = h.handle.start_single(album("T"), 1, None, 0).await.unwrap();
    let log = started.handle.await.unwrap().unwrap();

    assert_eq!(log.successful, 1);
    assert_eq!(h.fetcher.fetches_of("t-000.jpg"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_failure_is_non_fatal() {
    let h = harness(2, Duration::ZERO).await;
    h.catalog.add_album("D", "Album D", source_files("d", 3));
    h.backend.fail_metadata();

    let started = h.handle.start_single(album("D"), 3, None, 0).await.unwrap();
    let log = started.handle.await.unwrap().unwrap();

    assert_eq!(log.successful, 3);
    assert_eq!(log.failed, 0);
    assert!(h.backend.metadata().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clear_active_abandons_queued_files() {
    let h = harness(1, Duration::from_secs(1)).await;
    h.catalog.add_album("Q", "Album Q", source_files("q", 10));

    let started = h.handle.start_single(album("Q"), 10, None, 0).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    h.handle.clear_active().await.unwrap();
    started.handle.await.unwrap().unwrap();

    assert_eq!(h.handle.snapshot().status, TransferStatus::Idle);
    assert!(h.fetcher.fetch_count() < 10);
}

#[tokio::test(start_paused = true)]
async fn test_command_guards() {
    let h = harness(1, Duration::from_secs(1)).await;

    assert_eq!(
        h.handle.pause().await.unwrap_err(),
        CommandError::State(StateError::Transition(TransitionError::NotRunning))
    );
    assert_eq!(
        h.handle.start_batch(batch_request()).await.err(),
        Some(CommandError::Batch(BatchError::NoMatchingAlbums))
    );

    h.catalog.add_album("G", "Album G", source_files("g", 2));
    let started = h.handle.start_single(album("G"), 2, None, 0).await.unwrap();
    assert_eq!(
        h.handle.start_single(album("G"), 2, None, 0).await.err(),
        Some(CommandError::AlreadyRunning)
    );
    started.handle.await.unwrap().unwrap();

    assert!(h.handle.report_challenge(ChallengeTrigger::Blocked).is_some());
    assert_eq!(h.backend.created_albums().len(), 1);
}
