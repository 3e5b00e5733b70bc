use anyhow::{Context, Result};
use corral_core::{Error, Isolate, IsolateConfig, ModuleState, UserData, compile_natives};

use super::common::{RecordingHost, init_tracing, load_graph};

const LIB: &str = r#"export const value = 41; corral.print("lib");"#;
const MAIN: &str = r#"
    import { value } from "./lib.js";
    globalThis.answer = value + 1;
    corral.print("booted");
"#;

fn build_snapshot() -> Result<Vec<u8>> {
    let host = RecordingHost::default();
    let mut isolate = Isolate::new(IsolateConfig::new().host(host.clone()).will_snapshot(true))?;
    let main = load_graph(&mut isolate, "main.js", &[("main.js", MAIN), ("./lib.js", LIB)])?;
    isolate.instantiate(main)?;
    isolate.evaluate(UserData::NONE, main)?;
    assert_eq!(host.printed(), ["lib", "booted"]);
    isolate.snapshot().context("failed to create snapshot")
}

#[test]
fn snapshot_restores_modules_and_reruns_entries() -> Result<()> {
    init_tracing();
    let blob = build_snapshot()?;

    let host = RecordingHost::default();
    let mut isolate = Isolate::new(IsolateConfig::new().host(host.clone()).snapshot(blob))
        .context("failed to boot from snapshot")?;
    assert_eq!(host.printed(), ["lib", "booted"]);

    let main = isolate.find_module("main.js").context("main.js not restored")?;
    assert_eq!(isolate.module_state(main)?, ModuleState::Evaluated);
    assert_eq!(isolate.module_imports(main)?, ["./lib.js"]);

    isolate.execute(UserData::NONE, "inspect.js", "corral.print(String(globalThis.answer))")?;
    assert_eq!(host.printed(), ["lib", "booted", "42"]);
    Ok(())
}

#[test]
fn restored_modules_are_importable() -> Result<()> {
    init_tracing();
    let blob = build_snapshot()?;

    let host = RecordingHost::default();
    let mut isolate = Isolate::new(IsolateConfig::new().host(host.clone()).snapshot(blob))?;
    let app = isolate.register_module(
        true,
        "app.js",
        r#"import { value } from "./lib.js"; corral.print(`app ${value}`);"#,
    )?;
    let lib = isolate.find_module("./lib.js").context("lib not restored")?;
    isolate.resolve_imports(&mut |_: &str, _: &str| Ok(corral_core::Resolution::Existing(lib)))?;
    isolate.instantiate(app)?;
    isolate.evaluate(UserData::NONE, app)?;

    assert_eq!(host.printed(), ["lib", "booted", "app 41"]);
    Ok(())
}

#[test]
fn snapshot_requires_will_snapshot() -> Result<()> {
    init_tracing();
    let isolate = Isolate::new(IsolateConfig::new())?;
    assert!(matches!(isolate.snapshot(), Err(Error::State(_))));
    Ok(())
}

#[test]
fn corrupt_snapshot_is_a_bootstrap_error() -> Result<()> {
    init_tracing();
    let mut blob = build_snapshot()?;
    let last = blob.len() - 1;
    blob[last] ^= 0x55;

    let err = Isolate::new(IsolateConfig::new().snapshot(blob)).expect_err("corrupt blob");
    assert!(matches!(err, Error::Bootstrap(_)), "unexpected error: {err}");

    let err = Isolate::new(IsolateConfig::new().snapshot(b"not a blob".to_vec()))
        .expect_err("garbage blob");
    assert!(matches!(err, Error::Bootstrap(_)));
    Ok(())
}

#[test]
fn natives_blob_is_not_a_snapshot() -> Result<()> {
    init_tracing();
    let natives = compile_natives(&[("corral:util", "export const util = 1;")])?;
    let err = Isolate::new(IsolateConfig::new().snapshot(natives)).expect_err("wrong kind");
    assert!(matches!(err, Error::Bootstrap(_)));
    Ok(())
}
