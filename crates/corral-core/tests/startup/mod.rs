#![allow(dead_code)]

//! Process-wide startup data can only be installed once, so everything that
//! depends on it lives in this one test binary and one test.

#[path = "../isolate/common.rs"]
mod common;

use anyhow::{Context, Result};
use corral_core::{
    Error, Isolate, IsolateConfig, StartupData, UserData, compile_natives, install_startup_data,
};

use common::{RecordingHost, init_tracing};

const GREET: &str = r#"
    import { punctuation } from "corral:punct";
    export function greet(name) { return `hello, ${name}${punctuation}`; }
"#;

fn build_snapshot() -> Result<Vec<u8>> {
    let mut isolate = Isolate::new(IsolateConfig::new().will_snapshot(true))?;
    let setup = isolate.register_module(
        true,
        "setup.js",
        r#"globalThis.visitor = "corral"; corral.print("setup");"#,
    )?;
    isolate.instantiate(setup)?;
    isolate.evaluate(UserData::NONE, setup)?;
    isolate.snapshot().context("failed to create snapshot")
}

#[test]
fn startup_data_boots_isolates_with_natives() -> Result<()> {
    init_tracing();

    let err = Isolate::from_startup_data(IsolateConfig::new()).expect_err("nothing installed");
    assert!(matches!(err, Error::Bootstrap(_)), "unexpected error: {err}");

    let natives = compile_natives(&[
        ("corral:punct", r#"export const punctuation = "!";"#),
        ("corral:greet", GREET),
    ])?;
    let snapshot = build_snapshot()?;

    assert!(matches!(
        StartupData::new(&snapshot, &natives),
        Err(Error::Bootstrap(_))
    ));
    install_startup_data(StartupData::new(&natives, &snapshot)?)?;
    assert!(matches!(
        install_startup_data(StartupData::new(&natives, &snapshot)?),
        Err(Error::State(_))
    ));

    let host = RecordingHost::default();
    let mut isolate = Isolate::from_startup_data(IsolateConfig::new().host(host.clone()))?;
    assert_eq!(host.printed(), ["setup"]);

    let app = isolate.register_module(
        true,
        "app.js",
        r#"import { greet } from "corral:greet"; corral.print(greet(globalThis.visitor));"#,
    )?;
    isolate.resolve_imports(&mut |referrer: &str, specifier: &str| {
        Err(format!("{referrer} asked the resolver for {specifier}"))
    })?;
    isolate.instantiate(app)?;
    isolate.evaluate(UserData::NONE, app)?;
    assert_eq!(host.printed(), ["setup", "hello, corral!"]);

    let plain = Isolate::new(IsolateConfig::new())?;
    assert!(plain.find_module("corral:greet").is_some());
    assert!(plain.find_module("setup.js").is_none());
    Ok(())
}
