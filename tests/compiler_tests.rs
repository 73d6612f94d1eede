//! Compilation from description files on disk, and the properties the
//! compiled store must satisfy.

use std::path::{Path, PathBuf};

use geochain::compiler::{
    compile_pipeline, resolve_cross_references, CompilerContext, PipelineSpec,
};
use geochain::store::{CommandState, CommandStore, Target};

async fn write_pipeline(dir: &Path, name: &str, json: &str) -> PathBuf {
    let path = dir.join(format!("{name}.json"));
    tokio::fs::write(&path, json).await.unwrap();
    path
}

#[tokio::test]
async fn description_files_compile_into_one_store() {
    let dir = tempfile::tempdir().unwrap();
    let mnt = write_pipeline(
        dir.path(),
        "mnt",
        r#"{
            "name": "mnt",
            "workers": ["w1:7701", "w2:7701"],
            "tasks": [
                {"label": "fusion", "commands": ["step1", "step2"]},
                {"label": "slope", "depends_on": ["fusion"],
                 "remote": true, "parallel": true,
                 "commands": ["tile_a", "tile_b", "tile_c"]}
            ]
        }"#,
    )
    .await;
    let ortho = write_pipeline(
        dir.path(),
        "ortho",
        r#"{
            "name": "ortho",
            "tasks": [
                {"label": "mosaic", "depends_on": ["mnt.slope.1"], "commands": ["assemble"]}
            ]
        }"#,
    )
    .await;

    let store = CommandStore::create(dir.path().join("run.store"))
        .await
        .unwrap();

    let mnt_spec = PipelineSpec::from_path(&mnt).await.unwrap();
    let ortho_spec = PipelineSpec::from_path(&ortho).await.unwrap();

    let mut ctx = CompilerContext::new(mnt_spec.workers.clone());
    compile_pipeline(&ortho_spec, &mut ctx, &store).await.unwrap();
    compile_pipeline(&mnt_spec, &mut ctx, &store).await.unwrap();
    resolve_cross_references(&store, &ctx).await.unwrap();

    let all = store.all().await;
    // One command per text, none dropped or duplicated.
    assert_eq!(all.len(), 6);
    assert!(all.iter().all(|c| c.state == CommandState::Pending));
    assert!(store.placeholders().await.is_empty());

    // Round-robin over the 2-worker pool for the 3 remote tile commands.
    let remote_targets: Vec<String> = all
        .iter()
        .filter(|c| matches!(c.target, Target::Remote(_)))
        .map(|c| c.target.to_string())
        .collect();
    assert_eq!(remote_targets, vec!["w1:7701", "w2:7701", "w1:7701"]);

    // The cross-file reference expanded to all three tile commands.
    let mosaic = store.get(1).await.unwrap();
    assert_eq!(mosaic.resolved_deps().count(), 3);
}

#[tokio::test]
async fn malformed_description_is_reported_with_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_pipeline(dir.path(), "bad", r#"{"name": "bad""#).await;

    let err = PipelineSpec::from_path(&bad).await.unwrap_err();
    assert!(err.to_string().contains("bad.json"));
}
