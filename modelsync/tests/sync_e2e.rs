//! End-to-end upload reconciliation scenarios: policy-gated uploads,
//! corrective catalog actions and the pre-sync sanitizer.

mod common;

use common::test_pod;
use modelsync::catalog::MatchMode;
use modelsync::policy::{ExistingModel, NotifyStatus, SyncAction, SyncDecision};
use modelsync::reconciler::UploadReconciler;
use tokio_util::sync::CancellationToken;

fn allow_upload() -> SyncDecision {
    SyncDecision {
        can_sync: true,
        action: Some(SyncAction::Upload),
        reason: None,
        existing_model: None,
    }
}

fn reject(reason: &str) -> SyncDecision {
    SyncDecision {
        can_sync: false,
        action: Some(SyncAction::Reject),
        reason: Some(reason.to_string()),
        existing_model: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn permitted_upload_lands_with_provenance_metadata() {
    let pod = test_pod();
    let entry = pod.seed_entry("checkpoints", "new.safetensors", 0);
    std::fs::create_dir_all(entry.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(entry.local_path.as_std_path(), vec![5u8; 256]).unwrap();

    pod.policy.push_decision(allow_upload());

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let summary = reconciler
        .sync_local_models(&pod.conf.models_root.clone(), "models", "model_sync")
        .await
        .unwrap();

    assert_eq!(summary.eligible, 1);
    assert_eq!(summary.uploaded, 1);
    assert!(summary.fully_successful());

    // bytes landed at the derived destination
    let remote = pod
        .remote_object("models/checkpoints/new.safetensors")
        .await
        .unwrap();
    assert_eq!(remote.len(), 256);

    // the upload carried its provenance metadata
    let cancel = CancellationToken::new();
    let summary_head = pod
        .storage
        .head(
            &remote_storage::RemotePath::from_string("models/checkpoints/new.safetensors")
                .unwrap(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(
        summary_head
            .metadata
            .as_ref()
            .and_then(|m| m.get("downloadUrl")),
        entry.download_url.as_deref()
    );

    // catalog entry points at the uploaded destination, size corrected
    let stored = pod.catalog().get("checkpoints", "new.safetensors").unwrap();
    assert_eq!(stored.original_remote_path, "models/checkpoints/new.safetensors");
    assert_eq!(stored.model_size, 256);

    // the batch surface: PROGRESS 0 first, DONE 100 last
    let notifications = pod.policy.notifications();
    assert_eq!(notifications.first().unwrap().status, NotifyStatus::Progress);
    assert_eq!(notifications.first().unwrap().percentage, 0);
    assert_eq!(notifications.last().unwrap().status, NotifyStatus::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_upload_rejection_drops_the_catalog_entry() {
    let pod = test_pod();
    let entry = pod.seed_entry("checkpoints", "partial.safetensors", 0);
    std::fs::create_dir_all(entry.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(entry.local_path.as_std_path(), vec![0u8; 200]).unwrap();

    pod.policy.push_decision(reject("Partial upload detected"));

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let summary = reconciler
        .sync_local_models(&pod.conf.models_root.clone(), "models", "model_sync")
        .await
        .unwrap();

    assert_eq!(summary.removed, 1);
    assert_eq!(summary.uploaded, 0);
    assert!(summary.fully_successful());

    // catalog no longer knows the file, and nothing was uploaded
    assert!(pod.catalog().get("checkpoints", "partial.safetensors").is_none());
    assert!(pod
        .remote_object("models/checkpoints/partial.safetensors")
        .await
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_extension_rejection_drops_the_catalog_entry() {
    let pod = test_pod();
    let entry = pod.seed_entry("checkpoints", "weird.bin", 0);
    std::fs::create_dir_all(entry.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(entry.local_path.as_std_path(), b"payload").unwrap();

    pod.policy.push_decision(reject("Invalid file extension"));

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let summary = reconciler
        .sync_local_models(&pod.conf.models_root.clone(), "models", "model_sync")
        .await
        .unwrap();

    assert_eq!(summary.removed, 1);
    assert!(pod.catalog().get("checkpoints", "weird.bin").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_model_rejection_relinks_the_catalog() {
    let pod = test_pod();
    let entry = pod.seed_entry("checkpoints", "dup.safetensors", 0);
    std::fs::create_dir_all(entry.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(entry.local_path.as_std_path(), b"identical bytes").unwrap();

    pod.policy.push_decision(SyncDecision {
        can_sync: false,
        action: Some(SyncAction::Reject),
        reason: Some("duplicate content".to_string()),
        existing_model: Some(ExistingModel {
            original_remote_path: "models/shared/x.safetensors".to_string(),
            model_name: None,
            group: None,
        }),
    });

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let summary = reconciler
        .sync_local_models(&pod.conf.models_root.clone(), "models", "model_sync")
        .await
        .unwrap();

    assert_eq!(summary.relinked, 1);
    assert_eq!(summary.uploaded, 0);

    let stored = pod.catalog().get("checkpoints", "dup.safetensors").unwrap();
    assert_eq!(stored.original_remote_path, "models/shared/x.safetensors");
    // nothing was pushed
    assert!(pod
        .remote_object("models/checkpoints/dup.safetensors")
        .await
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn exact_path_rejection_is_a_noop() {
    let pod = test_pod();
    let entry = pod.seed_entry("checkpoints", "same.safetensors", 0);
    std::fs::create_dir_all(entry.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(entry.local_path.as_std_path(), b"already synced").unwrap();
    let before = pod.catalog().get("checkpoints", "same.safetensors").unwrap();

    pod.policy
        .push_decision(reject("Model already exists at this exact path"));

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let summary = reconciler
        .sync_local_models(&pod.conf.models_root.clone(), "models", "model_sync")
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    let after = pod.catalog().get("checkpoints", "same.safetensors").unwrap();
    assert_eq!(before.original_remote_path, after.original_remote_path);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_byte_and_scratch_files_are_filtered() {
    let pod = test_pod();
    // zero-byte file with a catalog entry
    let entry = pod.seed_entry("checkpoints", "empty.safetensors", 0);
    std::fs::create_dir_all(entry.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(entry.local_path.as_std_path(), b"").unwrap();
    // scratch files without catalog entries
    std::fs::write(
        pod.conf.models_root.join("checkpoints/download.log").as_std_path(),
        b"log",
    )
    .unwrap();
    std::fs::write(
        pod.conf.models_root.join("checkpoints/x.tmp").as_std_path(),
        b"tmp",
    )
    .unwrap();

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let summary = reconciler
        .sync_local_models(&pod.conf.models_root.clone(), "models", "model_sync")
        .await
        .unwrap();

    assert_eq!(summary.eligible, 0);
    assert!(pod.policy.permission_requests.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn sanitizer_consolidates_duplicates_before_sync() {
    let pod = test_pod();

    // two local files sharing one download url; the checkpoints copy is larger
    let primary = pod.seed_entry("checkpoints", "shared.safetensors", 10);
    std::fs::create_dir_all(primary.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(primary.local_path.as_std_path(), vec![1u8; 512]).unwrap();

    let mut alias = pod.seed_entry("loras", "shared.safetensors", 10);
    std::fs::create_dir_all(alias.local_path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(alias.local_path.as_std_path(), vec![1u8; 256]).unwrap();
    alias.download_url = primary.download_url.clone();
    pod.catalog().upsert(alias).unwrap();

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let rewritten = reconciler.sanitize_catalog().unwrap();
    assert_eq!(rewritten, 1);

    // the alias now shares the primary's canonical remote path
    let alias_after = pod.catalog().get("loras", "shared.safetensors").unwrap();
    assert_eq!(
        alias_after.original_remote_path,
        "models/checkpoints/shared.safetensors"
    );
    // the primary's recorded size was corrected from disk
    let primary_after = pod.catalog().get("checkpoints", "shared.safetensors").unwrap();
    assert_eq!(primary_after.model_size, 512);
    // sanitization itself does not touch the filesystem
    assert!(std::fs::symlink_metadata(alias_after.local_path.as_std_path())
        .unwrap()
        .is_file());

    // idempotence: a second run changes nothing
    assert_eq!(reconciler.sanitize_catalog().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn files_without_catalog_entries_are_skipped() {
    let pod = test_pod();
    std::fs::create_dir_all(pod.conf.models_root.join("checkpoints").as_std_path()).unwrap();
    std::fs::write(
        pod.conf.models_root.join("checkpoints/unknown.safetensors").as_std_path(),
        b"mystery bytes",
    )
    .unwrap();

    let reconciler = UploadReconciler::new(
        pod.conf.clone(),
        pod.storage.clone(),
        pod.policy.clone(),
    );
    let summary = reconciler
        .sync_local_models(&pod.conf.models_root.clone(), "models", "model_sync")
        .await
        .unwrap();

    assert_eq!(summary.eligible, 0);
    // catalog untouched for unknown files
    assert!(pod
        .catalog()
        .find_by_local_path("unknown.safetensors", MatchMode::Contains)
        .is_empty());
}
