use super::test_helpers::{add_unit, decoded_code, test_config};
use crate::cache::CacheEntry;
use crate::context::CACHE_DIR;
use crate::unit::Insn;
use crate::unit::digest::{UnitDigest, artifact_name};
use crate::{LoaderContext, PipelineContext};

#[test]
fn crash_before_commit_rolls_back_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let raw = add_unit(2, 3);
    let source = UnitDigest::of(&raw).strong;
    let artifact = dir
        .path()
        .join(CACHE_DIR)
        .join("artifacts")
        .join(artifact_name("app/Crash", &source));

    {
        let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
        ctx.cache()
            .cold()
            .store_uncommitted("app/Crash", &source, b"half-written")
            .unwrap();
        assert!(artifact.exists());
        assert!(ctx.cache().cold().entry("app/Crash").is_some());
    }

    let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
    assert_eq!(ctx.heal_report().wal_rolled_back, 1);
    assert!(ctx.cache().cold().entry("app/Crash").is_none());
    assert!(!artifact.exists());

    // The unit is simply optimized again.
    let out = ctx.transform("app/Crash", raw, &LoaderContext::new());
    assert_eq!(decoded_code(&out), vec![Insn::Const(5), Insn::Return]);
    assert_eq!(ctx.metrics().pipeline_runs, 1);
}

#[test]
fn committed_entries_survive_alongside_a_crashed_store() {
    let dir = tempfile::tempdir().unwrap();
    let kept = add_unit(1, 2);
    {
        let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
        ctx.transform("app/Kept", kept.clone(), &LoaderContext::new());
        assert!(ctx.flush());
        let source = UnitDigest::of(&add_unit(9, 9)).strong;
        ctx.cache()
            .cold()
            .store_uncommitted("app/Lost", &source, b"partial")
            .unwrap();
    }

    let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
    let keys: Vec<String> = ctx
        .cache()
        .cold()
        .entries()
        .into_iter()
        .map(|entry: CacheEntry| entry.unit_key)
        .collect();
    assert_eq!(keys, vec!["app/Kept".to_string()]);

    ctx.transform("app/Kept", kept, &LoaderContext::new());
    assert_eq!(ctx.metrics().pipeline_runs, 0);
}

#[test]
fn truncated_artifact_is_purged_and_reoptimized() {
    let dir = tempfile::tempdir().unwrap();
    let raw = add_unit(3, 4);
    let path = {
        let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
        ctx.transform("app/Torn", raw.clone(), &LoaderContext::new());
        assert!(ctx.flush());
        let entry = ctx.cache().cold().entry("app/Torn").unwrap();
        ctx.cache().cold().artifact_path(&entry)
    };
    std::fs::write(&path, b"torn").unwrap();

    let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
    assert_eq!(ctx.heal_report().size_mismatches, 1);
    assert!(ctx.cache().cold().is_empty());

    let out = ctx.transform("app/Torn", raw, &LoaderContext::new());
    assert_eq!(decoded_code(&out), vec![Insn::Const(7), Insn::Return]);
    assert_eq!(ctx.metrics().pipeline_runs, 1);
}
