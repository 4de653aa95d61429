mod support;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use aura_harness::genesis::{genesis_contract_accounts, NETWORK_CONSENSUS_ADDRESS};
use aura_harness::{HarnessError, SpecSource};
use tokio::sync::oneshot;

use support::{harness_config, orchestrator, wait_for_exit, StubBuilder, StubProbe, CHAIN_ID};

#[tokio::test]
async fn empty_cache_builds_spec_and_reaches_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let builder = Arc::new(StubBuilder::default());
    let probe = Arc::new(StubProbe::ready());
    let mut harness = orchestrator(harness_config(dir.path()), builder.clone(), probe.clone());

    let mut outcome = harness.bootstrap().await.expect("bootstrap");

    assert_eq!(outcome.endpoint.url(), "http://localhost:8050");
    assert_eq!(outcome.chain_id, CHAIN_ID);
    assert_eq!(outcome.spec_source, SpecSource::Built);
    assert_eq!(builder.calls(), 1);
    assert!(probe.calls() >= 1);
    assert!(dir.path().join(".spec/osA+consA.json").is_file());
    assert!(dir.path().join(".spec/osA+consA.abi.json").is_file());
    assert!(dir.path().join(".spec/osA+consA-master-of-ceremony-key.json").is_file());
    assert!(dir.path().join(".spec/osA+consA-master-of-ceremony.key").is_file());
    assert_eq!(
        fs::read(dir.path().join(".tmp/spec.json")).expect("staged spec"),
        fs::read(dir.path().join(".spec/osA+consA.json")).expect("cached spec")
    );
    assert_eq!(
        fs::read_to_string(dir.path().join(".pid")).expect("pid record"),
        outcome.node.pid().to_string()
    );

    assert_eq!(outcome.network_id, "arbitraryidentifier");
    assert_eq!(outcome.spec.network_id(), Some(0x1a4));
    assert!(outcome.spec.account(&outcome.signer.to_checksum()).is_some());
    for address in genesis_contract_accounts().values() {
        assert!(outcome.spec.account(address).is_some(), "missing {address}");
    }
    assert!(outcome
        .spec
        .contract_interface(NETWORK_CONSENSUS_ADDRESS)
        .expect("interface document")
        .is_some());

    assert_eq!(harness.teardown(), 1);
    wait_for_exit(&mut outcome.node).await;
    assert!(harness.registry().is_empty());
}

#[tokio::test]
async fn second_bootstrap_reuses_cached_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first_builder = Arc::new(StubBuilder::default());
    let mut first = orchestrator(
        harness_config(dir.path()),
        first_builder.clone(),
        Arc::new(StubProbe::ready()),
    );
    let mut outcome = first.bootstrap().await.expect("first bootstrap");
    first.teardown();
    wait_for_exit(&mut outcome.node).await;

    let cached = [
        ".spec/osA+consA.json",
        ".spec/osA+consA.abi.json",
        ".spec/osA+consA-master-of-ceremony-key.json",
        ".spec/osA+consA-master-of-ceremony.key",
    ];
    let before: Vec<Vec<u8>> = cached
        .iter()
        .map(|path| fs::read(dir.path().join(path)).expect("cached artifact"))
        .collect();

    let second_builder = Arc::new(StubBuilder::default());
    let mut second = orchestrator(
        harness_config(dir.path()),
        second_builder.clone(),
        Arc::new(StubProbe::ready()),
    );
    let mut again = second.bootstrap().await.expect("second bootstrap");

    assert_eq!(second_builder.calls(), 0, "cache hit must skip the builder");
    assert_eq!(again.spec_source, SpecSource::Cached);
    assert_eq!(again.signer, outcome.signer);
    assert_eq!(again.chain_id, CHAIN_ID);
    for (path, expected) in cached.iter().zip(&before) {
        let after = fs::read(dir.path().join(path)).expect("cached artifact");
        assert_eq!(&after, expected, "{path} changed");
    }

    second.teardown();
    wait_for_exit(&mut again.node).await;
}

#[tokio::test]
async fn parent_pid_record_keeps_first_node_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = orchestrator(
        harness_config(dir.path()),
        Arc::new(StubBuilder::default()),
        Arc::new(StubProbe::ready()),
    );

    let mut outcome = harness.bootstrap().await.expect("bootstrap");
    let (mut second, chain_id) = harness.add_node().await.expect("second node");

    assert_eq!(chain_id, CHAIN_ID);
    assert_ne!(second.pid(), outcome.node.pid());
    assert_eq!(second.endpoint().url(), "http://localhost:8051");
    assert_eq!(second.process().ordinal, 1);
    assert_eq!(harness.registry().len(), 2);
    assert_eq!(
        fs::read_to_string(dir.path().join(".pid")).expect("pid record"),
        outcome.node.pid().to_string()
    );

    assert_eq!(harness.teardown(), 2);
    wait_for_exit(&mut outcome.node).await;
    wait_for_exit(&mut second).await;
}

#[tokio::test]
async fn add_node_requires_bootstrap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = orchestrator(
        harness_config(dir.path()),
        Arc::new(StubBuilder::default()),
        Arc::new(StubProbe::ready()),
    );
    let err = harness.add_node().await.expect_err("no bootstrap yet");
    assert!(matches!(err, HarnessError::Config(_)));
    assert!(harness.registry().is_empty());
}

#[tokio::test]
async fn builder_failure_aborts_before_launch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let builder = Arc::new(StubBuilder::failing());
    let probe = Arc::new(StubProbe::ready());
    let mut harness = orchestrator(harness_config(dir.path()), builder.clone(), probe.clone());

    let err = harness.bootstrap().await.expect_err("build must fail");

    assert!(matches!(err, HarnessError::BuildFailure(_)), "unexpected error {err}");
    assert_eq!(builder.calls(), 1);
    assert_eq!(probe.calls(), 0);
    assert!(harness.registry().is_empty());
    assert!(!dir.path().join(".spec/osA+consA.json").exists());
    assert!(!dir.path().join(".pid").exists());
}

#[tokio::test]
async fn silent_node_times_out_as_not_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = harness_config(dir.path());
    config.readiness.timeout_ms = 200;
    let mut harness = orchestrator(
        config,
        Arc::new(StubBuilder::default()),
        Arc::new(StubProbe::silent()),
    );

    let err = harness.bootstrap().await.expect_err("never ready");
    match err {
        HarnessError::NotReady {
            endpoint, waited, ..
        } => {
            assert_eq!(endpoint, "http://localhost:8050");
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("unexpected error {other}"),
    }

    assert_eq!(harness.teardown(), 1, "the launched node is still tracked");
}

#[tokio::test]
async fn node_exiting_early_is_launch_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = harness_config(dir.path());
    config.node.program = "false".to_string();
    config.node.args = Vec::new();
    let mut harness = orchestrator(
        config,
        Arc::new(StubBuilder::default()),
        Arc::new(StubProbe::silent()),
    );

    let err = harness.bootstrap().await.expect_err("node dies");
    assert!(matches!(err, HarnessError::LaunchFailure(_)), "unexpected error {err}");
    assert!(harness.registry().is_empty());
}

#[tokio::test]
async fn existing_directories_rejected_under_strict_policy() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join(".tmp")).expect("pre-create work dir");
    let mut config = harness_config(dir.path());
    config.existing_dirs = aura_harness::config::ExistingDirPolicy::Reject;
    let builder = Arc::new(StubBuilder::default());
    let mut harness = orchestrator(config, builder.clone(), Arc::new(StubProbe::ready()));

    let err = harness.bootstrap().await.expect_err("work dir exists");
    assert!(matches!(err, HarnessError::DirectoryExists(_)), "unexpected error {err}");
    assert_eq!(builder.calls(), 0);
}

#[tokio::test]
async fn teardown_guard_kills_nodes_when_task_panics() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = harness_config(dir.path());
    let (node_tx, node_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut harness = orchestrator(
            config,
            Arc::new(StubBuilder::default()),
            Arc::new(StubProbe::ready()),
        );
        let _guard = harness.teardown_guard();
        let outcome = harness.bootstrap().await.expect("bootstrap");
        node_tx.send(outcome.node).expect("hand node out");
        panic!("assertion inside the suite failed");
    });

    let join = task.await;
    assert!(join.expect_err("task panicked").is_panic());

    let mut node = node_rx.await.expect("node handed out");
    let status = wait_for_exit(&mut node).await;
    assert!(status.contains("signal"), "expected a signal exit, got {status}");
}
