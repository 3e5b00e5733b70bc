use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use corral_core::{Completion, Error, Isolate, IsolateConfig, PrintLevel, UserData};

use super::common::{RecordingHost, init_tracing, isolate};

fn run(isolate: &mut Isolate, source: &str) -> Result<()> {
    isolate
        .execute(UserData::NONE, "test.js", source)
        .with_context(|| format!("script failed: {source}"))
}

#[test]
fn send_pins_zero_copy_buffer_until_released() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(
        &mut isolate,
        r"
        globalThis.zc = new Uint8Array([9, 8, 7]);
        corral.send(new Uint8Array([1, 2, 3]), zc.subarray(1));
        ",
    )?;

    let received = host.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].control, [1, 2, 3]);
    let (id, bytes) = received[0].zero_copy.clone().context("no zero-copy buffer")?;
    assert_eq!(bytes, [8, 7]);
    assert_eq!(isolate.buffer_count(), 1);

    isolate
        .with_buffer(id, |bytes| bytes[0] = 42)
        .context("buffer should still be pinned")?;
    run(&mut isolate, "corral.print(Array.from(zc).join(','))")?;
    assert_eq!(host.printed(), ["9,42,7"]);

    assert!(isolate.detach_buffer(id));
    assert_eq!(isolate.buffer_count(), 0);
    assert!(!isolate.detach_buffer(id), "second release is a no-op");
    assert!(isolate.with_buffer(id, |_| ()).is_none());
    Ok(())
}

#[test]
fn buffer_ids_increase_across_sends() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(
        &mut isolate,
        r"
        for (let i = 0; i < 3; i++) {
            corral.send(new Uint8Array([i]), new Uint8Array(4));
        }
        ",
    )?;

    let ids: Vec<u64> = host
        .received()
        .iter()
        .filter_map(|received| received.zero_copy.as_ref().map(|(id, _)| id.get()))
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| *id != 0));
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

#[test]
fn send_returns_host_response() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    host.reply_with(vec![5, 6]);
    run(
        &mut isolate,
        r"
        const response = corral.send(new Uint8Array([0]));
        corral.print(String(response[0] + response[1]));
        corral.print(String(corral.send(new Uint8Array([1])) === undefined));
        ",
    )?;
    assert_eq!(host.printed(), ["11", "true"]);
    Ok(())
}

#[test]
fn user_data_reaches_host_for_the_call_only() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    let mut token = 7_u32;
    let user_data = UserData::new((&raw mut token).cast());

    isolate.execute(user_data, "send.js", "corral.send(new Uint8Array([1]))")?;
    run(&mut isolate, "corral.send(new Uint8Array([2]))")?;

    let received = host.received();
    assert_eq!(received[0].user_data, user_data);
    assert!(received[1].user_data.is_none());
    Ok(())
}

#[test]
fn dispatch_invokes_registered_callback() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    assert!(matches!(
        isolate.dispatch(UserData::NONE, &[1]),
        Err(Error::State(_))
    ));

    run(
        &mut isolate,
        r#"corral.recv((msg) => corral.print(`got ${msg.length}:${msg[0]}`));"#,
    )?;
    isolate.dispatch(UserData::NONE, &[7, 1])?;
    assert_eq!(host.printed(), ["got 2:7"]);

    let err = isolate
        .execute(UserData::NONE, "again.js", "corral.recv(() => {})")
        .expect_err("second registration must throw");
    let Error::Guest(info) = err else {
        panic!("expected guest error, got {err:?}");
    };
    assert_eq!(info.name.as_deref(), Some("TypeError"));
    Ok(())
}

#[test]
fn eval_context_reports_instead_of_throwing() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(
        &mut isolate,
        r#"
        let [value, error] = corral.evalContext("1 + 2");
        corral.print(`${value} ${error}`);

        [value, error] = corral.evalContext("throw new RangeError('x')");
        corral.print([value === undefined, error.message, error.isNativeError, error.isCompileError].join(","));

        [value, error] = corral.evalContext("}");
        corral.print([error.isCompileError, error.thrown instanceof SyntaxError].join(","));

        [value, error] = corral.evalContext("throw 5");
        corral.print([error.isNativeError, error.thrown].join(","));
        "#,
    )?;
    assert_eq!(
        host.printed(),
        ["3 null", "true,x,true,false", "true,true", "false,5"]
    );
    Ok(())
}

#[test]
fn error_to_json_is_structured() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(
        &mut isolate,
        r#"
        function fail() { throw new TypeError("bad"); }
        try { fail(); } catch (e) {
            const info = corral.errorToJSON(e);
            corral.print(`${info.name}:${info.message}:${info.frames.length > 0}`);
        }
        "#,
    )?;
    assert_eq!(host.printed(), ["TypeError:bad:true"]);
    Ok(())
}

#[test]
fn completions_settle_pending_promises() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(
        &mut isolate,
        r#"
        corral.pending(1).then((bytes) => corral.print(`resolved ${bytes[0]}`));
        corral.pending(2).catch((err) => corral.print(`rejected ${err.message}`));
        "#,
    )?;
    assert_eq!(isolate.pending_count(), 2);

    assert!(isolate.complete(UserData::NONE, 1, Completion::Ok(vec![9]))?);
    assert!(isolate.complete(UserData::NONE, 2, Completion::Err("nope".to_owned()))?);
    assert_eq!(host.printed(), ["resolved 9", "rejected nope"]);
    assert_eq!(isolate.pending_count(), 0);

    assert!(!isolate.complete(UserData::NONE, 1, Completion::Ok(vec![]))?);
    assert_eq!(host.printed().len(), 2);
    Ok(())
}

#[test]
fn unknown_completion_leaves_pending_entries_alone() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(&mut isolate, "corral.pending(3).then(() => corral.print('done'))")?;

    assert!(!isolate.complete(UserData::NONE, 99, Completion::Ok(vec![1]))?);
    assert!(isolate.is_pending(3));
    assert_eq!(isolate.pending_count(), 1);
    assert!(host.printed().is_empty());
    Ok(())
}

#[test]
fn duplicate_pending_id_throws() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    let err = isolate
        .execute(UserData::NONE, "dup.js", "corral.pending(4); corral.pending(4);")
        .expect_err("duplicate id must throw");
    let Error::Guest(info) = err else {
        panic!("expected guest error, got {err:?}");
    };
    assert_eq!(info.name.as_deref(), Some("RangeError"));
    assert!(isolate.is_pending(4));
    Ok(())
}

#[test]
fn teardown_abandons_pending_operations() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(
        &mut isolate,
        r"
        corral.pending(1).then(() => corral.print('late'));
        corral.send(new Uint8Array([0]), new Uint8Array(8));
        ",
    )?;
    assert_eq!(isolate.pending_count(), 1);
    assert_eq!(isolate.buffer_count(), 1);
    drop(isolate);

    assert!(host.printed().is_empty());
    Ok(())
}

#[test]
fn console_routes_to_host_print() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(
        &mut isolate,
        r#"
        console.log("a", 1, true);
        console.warn("careful");
        console.error("broken");
        corral.print("plain");
        corral.print("bad", true);
        "#,
    )?;
    assert_eq!(
        host.printed_with_level(),
        [
            (PrintLevel::Info, "a 1 true".to_owned()),
            (PrintLevel::Warn, "careful".to_owned()),
            (PrintLevel::Error, "broken".to_owned()),
            (PrintLevel::Info, "plain".to_owned()),
            (PrintLevel::Error, "bad".to_owned()),
        ]
    );
    Ok(())
}

#[test]
fn shared_buffer_is_visible_to_both_sides() -> Result<()> {
    init_tracing();
    let host = RecordingHost::default();
    let mut isolate = Isolate::new(IsolateConfig::new().host(host.clone()).shared(vec![0; 4]))?;

    run(&mut isolate, "new Uint8Array(corral.shared)[0] = 7;")?;
    assert_eq!(isolate.with_shared(|bytes| bytes[0]), Some(7));

    isolate.with_shared(|bytes| bytes[1] = 3);
    run(
        &mut isolate,
        "corral.print(String(new Uint8Array(corral.shared)[1]))",
    )?;
    assert_eq!(host.printed(), ["3"]);
    Ok(())
}

#[test]
fn shared_buffer_is_optional() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    assert!(isolate.with_shared(|bytes| bytes.len()).is_none());
    run(&mut isolate, "corral.print(String(corral.shared))")?;
    assert_eq!(host.printed(), ["undefined"]);
    Ok(())
}

#[test]
fn uncaught_exception_is_stored_until_cleared() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    let err = isolate
        .execute(UserData::NONE, "throw.js", "throw new Error('boom')")
        .expect_err("script throws");
    assert!(matches!(err, Error::Guest(ref info) if info.message == "boom"));

    let info = isolate
        .last_exception_info()
        .context("last exception missing")?;
    assert_eq!(info.name.as_deref(), Some("Error"));
    assert_eq!(info.message, "boom");

    run(&mut isolate, "1 + 1")?;
    assert!(isolate.last_exception().is_some(), "success does not clear it");

    isolate.clear_last_exception();
    assert!(isolate.last_exception().is_none());
    Ok(())
}

#[test]
fn unhandled_rejection_becomes_last_exception() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    run(&mut isolate, "Promise.reject(new Error('handled')).catch(() => {})")?;
    assert!(isolate.last_exception().is_none());

    let err = isolate
        .execute(UserData::NONE, "lost.js", "Promise.reject(new Error('lost'))")
        .expect_err("unhandled rejection");
    assert!(matches!(err, Error::Guest(ref info) if info.message == "lost"));
    let last = isolate.take_last_exception().context("last exception missing")?;
    assert!(last.contains("lost"));
    assert!(isolate.last_exception().is_none());
    Ok(())
}

#[test]
fn termination_interrupts_running_script() -> Result<()> {
    let host = RecordingHost::default();
    let mut isolate = isolate(&host)?;
    let handle = isolate.termination_handle();
    let done = Arc::new(AtomicBool::new(false));
    let stopper = thread::spawn({
        let done = Arc::clone(&done);
        move || {
            // Entering the isolate clears earlier requests, so keep asking.
            while !done.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
                handle.terminate();
            }
        }
    });

    let err = isolate
        .execute(UserData::NONE, "spin.js", "for (;;) {}")
        .expect_err("loop must be interrupted");
    done.store(true, Ordering::Relaxed);
    stopper.join().expect("stopper thread panicked");
    assert!(matches!(err, Error::Guest(_)));

    run(&mut isolate, "corral.print('alive')")?;
    assert_eq!(host.printed(), ["alive"]);
    Ok(())
}
