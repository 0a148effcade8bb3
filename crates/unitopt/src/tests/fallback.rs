use bytes::Bytes;
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};

use super::test_helpers::{add_unit, encode, test_config};
use crate::unit::{Insn, UnitIr, codec};
use crate::{LoaderContext, PipelineContext};

#[test]
fn arbitrary_bytes_come_back_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = PipelineContext::open(test_config(dir.path())).unwrap();

    let mut runner = TestRunner::new(Config::with_cases(128));
    runner
        .run(&vec(any::<u8>(), 0..512), |bytes| {
            let raw = Bytes::from(bytes);
            let out = ctx.transform("fuzz/Random", raw.clone(), &LoaderContext::new());
            prop_assert_eq!(out, raw);
            Ok(())
        })
        .unwrap();
    assert_eq!(ctx.metrics().pipeline_runs, 0);
}

#[test]
fn truncated_units_come_back_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
    let full = add_unit(2, 3);

    let mut runner = TestRunner::new(Config::with_cases(64));
    runner
        .run(&(0..full.len()), |cut| {
            let raw = full.slice(..cut);
            let out = ctx.transform("fuzz/Truncated", raw.clone(), &LoaderContext::new());
            prop_assert_eq!(out, raw);
            Ok(())
        })
        .unwrap();
}

#[test]
fn corrupted_units_never_escape_as_invalid_output() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = PipelineContext::open(test_config(dir.path())).unwrap();
    let full = add_unit(2, 3);

    let mut runner = TestRunner::new(Config::with_cases(128));
    runner
        .run(&(0..full.len(), 1..=255u8), |(index, mask)| {
            let mut bytes = full.to_vec();
            bytes[index] ^= mask;
            let raw = Bytes::from(bytes);
            let out = ctx.transform("fuzz/Flipped", raw.clone(), &LoaderContext::new());
            prop_assert!(out == raw || codec::decode(&out).is_ok());
            Ok(())
        })
        .unwrap();
}

#[test]
fn oversized_unit_is_passed_through() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.limits.max_unit_size = 96;
    let ctx = PipelineContext::open(config).unwrap();

    let mut unit = UnitIr::new(0);
    unit.max_stack = 2;
    unit.code = vec![Insn::Const(1)];
    for n in 0..8 {
        unit.code.push(Insn::Const(n));
        unit.code.push(Insn::Binary(crate::unit::BinOp::Add));
    }
    unit.code.push(Insn::Return);
    let raw = encode(&unit);
    assert!(raw.len() > 96);

    assert_eq!(ctx.transform("app/Big", raw.clone(), &LoaderContext::new()), raw);
    let metrics = ctx.metrics();
    assert_eq!(metrics.rejections, 1);
    assert_eq!(metrics.pipeline_runs, 0);
}

#[test]
fn malformed_control_flow_is_passed_through_without_blame() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = PipelineContext::open(test_config(dir.path())).unwrap();

    let mut unit = UnitIr::new(0);
    unit.max_stack = 1;
    // Branch past the end of the code.
    unit.code = vec![Insn::Const(1), Insn::Goto(40), Insn::Return];
    let raw = encode(&unit);

    assert_eq!(ctx.transform("app/Broken", raw.clone(), &LoaderContext::new()), raw);
    assert!(ctx.governor().ledger().unit_failures.is_empty());
    assert!(ctx.governor().disabled_passes().is_empty());
}
