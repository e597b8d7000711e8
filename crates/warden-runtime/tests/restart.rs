/// Restart behaviour with the file-backed registry and snapshot store.
///
/// Each test opens a warden over a temp directory, drops it, and opens a new
/// one over the same directory as a restarted process would.
mod common;

use std::path::Path;

use common::{Detector, config};
use serde_json::json;
use warden_core::{
    ComponentDescriptor, Criticality, FileRegistry, LifecycleState, RegistryStore, RestState,
    StateUpdate, WardenConfig, WardenError,
};
use warden_runtime::{FileBlobStore, Warden};

fn on_disk(dir: &Path, capacity: u64) -> WardenConfig {
    let mut config = config(capacity);
    config.storage.registry_dir = Some(dir.join("registry"));
    config.storage.snapshot_dir = Some(dir.join("snapshots"));
    config
}

#[tokio::test]
async fn dormant_state_survives_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let snapshot_id = {
        let warden = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
        let detector = Detector::with_rules(b"rule ransom_note { condition: true }");
        warden
            .register(ComponentDescriptor::new("yara", Criticality::High, 30), detector)
            .await
            .unwrap();
        warden.admin().wake("yara").await.unwrap();
        let status = warden.admin().sleep("yara").await.unwrap();
        status.snapshot_id.unwrap()
    };

    let warden = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
    let report = warden.recover().await.unwrap();
    assert!(report.demoted.is_empty());
    assert!(report.interrupted.is_empty());

    let status = warden.admin().get_component("yara").await.unwrap();
    assert_eq!(status.state, LifecycleState::Dormant);
    assert_eq!(status.snapshot_id.as_deref(), Some(snapshot_id.as_str()));

    let fresh = Detector::new();
    warden.attach("yara", fresh.clone()).await.unwrap();
    warden.invoke("yara", &json!({"path": "/tmp/a.exe"})).await.unwrap();
    assert_eq!(fresh.rules(), b"rule ransom_note { condition: true }");
}

#[tokio::test]
async fn recover_demotes_active_and_interrupted_components() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let warden = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
        for (id, criticality) in [
            ("edr", Criticality::Critical),
            ("ml", Criticality::Medium),
            ("ocr", Criticality::Low),
        ] {
            warden
                .register(ComponentDescriptor::new(id, criticality, 20), Detector::new())
                .await
                .unwrap();
        }
        warden.admin().wake("ml").await.unwrap();
    }
    // Simulate a crash in the middle of a wake.
    let registry = FileRegistry::new(tmp.path().join("registry"));
    registry
        .update_state(
            "ocr",
            StateUpdate::to(LifecycleState::transitioning(
                RestState::Dormant,
                RestState::Active,
            )),
            LifecycleState::Dormant,
        )
        .await
        .unwrap();

    let warden = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
    // Opening alone changes nothing.
    assert_eq!(
        warden.controller().state("ml").await.unwrap(),
        LifecycleState::Active
    );

    let mut report = warden.recover().await.unwrap();
    report.demoted.sort();
    assert_eq!(report.demoted, vec!["edr", "ml"]);
    assert_eq!(report.interrupted, vec!["ocr"]);
    assert_eq!(report.queued, vec!["edr"]);

    for id in ["edr", "ml", "ocr"] {
        assert_eq!(
            warden.controller().state(id).await.unwrap(),
            LifecycleState::Dormant
        );
    }
    let ocr = warden.admin().get_component("ocr").await.unwrap();
    assert!(ocr.last_error.unwrap().contains("interrupted by restart"));
    assert_eq!(warden.admin().budget().await.allocated, 0);
}

#[tokio::test]
async fn corrupted_snapshot_disables_instead_of_loading() {
    let tmp = tempfile::tempdir().unwrap();
    let snapshot_id = {
        let warden = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
        warden
            .register(
                ComponentDescriptor::new("sandbox", Criticality::High, 50),
                Detector::with_rules(b"emulator image v7"),
            )
            .await
            .unwrap();
        warden.admin().wake("sandbox").await.unwrap();
        warden.admin().sleep("sandbox").await.unwrap().snapshot_id.unwrap()
    };

    let blob = FileBlobStore::new(tmp.path().join("snapshots")).blob_path(&snapshot_id);
    let mut bytes = std::fs::read(&blob).unwrap();
    bytes[0] ^= 0x01;
    std::fs::write(&blob, bytes).unwrap();

    let warden = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
    warden.recover().await.unwrap();
    let fresh = Detector::new();
    warden.attach("sandbox", fresh.clone()).await.unwrap();

    let err = warden.invoke("sandbox", &json!({})).await.unwrap_err();
    assert!(matches!(err, WardenError::ChecksumMismatch { .. }), "got {err:?}");
    assert!(fresh.rules().is_empty());

    let status = warden.admin().get_component("sandbox").await.unwrap();
    assert_eq!(status.state, LifecycleState::Disabled);
    assert_eq!(warden.admin().budget().await.allocated, 0);
    assert_eq!(warden.metrics().snapshot().integrity_failures, 1);
}

#[tokio::test]
async fn committed_budget_reads_the_persisted_records() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let warden = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
        for (id, cost) in [("a", 30), ("b", 25)] {
            warden
                .register(
                    ComponentDescriptor::new(id, Criticality::Medium, cost),
                    Detector::new(),
                )
                .await
                .unwrap();
            warden.admin().wake(id).await.unwrap();
        }
    }

    // A second process inspecting the same registry, as the CLI does.
    let observer = Warden::open(on_disk(tmp.path(), 100)).await.unwrap();
    let committed = observer.admin().committed_budget().await.unwrap();
    assert_eq!(committed.allocated, 55);
    assert_eq!(committed.available, 45);
    assert_eq!(observer.admin().budget().await.allocated, 0);
}
