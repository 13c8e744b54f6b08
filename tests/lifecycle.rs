mod common;

use std::sync::Arc;
use ddc_exchange::persist::MemoryStore;
use ddc_exchange::{
    check_communication, check_displays, Config, Context, DisplayHandle, DisplayPath, DisplayRef, DisplayState,
    DsaSnapshot, DsaStore, Error, InvalidReason, Status, UnsupportedSentinel,
};
use self::common::*;

fn probe_ok(code: u8) -> Step {
    vcp_reply(code, 0, 100, 50)
}

#[test]
fn handles_are_exclusive() {
    let path = DisplayPath::i2c(3);
    let opener = ScriptedOpener::default().with(path, ScriptedTransport::new(vec![]));
    let context = context();
    let display = display(3);

    let handle = DisplayHandle::open(&context, display.clone(), &opener).unwrap();
    assert!(context.open_handles().contains(&path));
    match DisplayHandle::open(&context, display.clone(), &opener) {
        Err(Error::AlreadyOpen(p)) => assert_eq!(p, path),
        res => panic!("unexpected result {:?}", res),
    }

    handle.close().unwrap();
    assert!(context.open_handles().is_empty());
    assert_eq!(opener.transport(&path).script().closed, 1);

    // dropping releases the display too
    drop(DisplayHandle::open(&context, display.clone(), &opener).unwrap());
    assert!(context.open_handles().is_empty());
    assert_eq!(opener.transport(&path).script().closed, 2);
}

#[test]
fn open_fails_for_missing_displays() {
    let path = DisplayPath::i2c(3);
    let mut opener = ScriptedOpener::default();
    opener.missing.push(path);
    let context = context();
    let display = display(3);

    let err = DisplayHandle::open(&context, display.clone(), &opener).unwrap_err();
    assert_eq!(err.status(), Status::Disconnected);
    assert!(display.is_removed());
    assert_eq!(display.state(), DisplayState::Failed(InvalidReason::Removed));

    // a failed open leaves no marker behind
    let other = ddc_exchange::DisplayRef::new(DisplayPath::i2c(8), None);
    let err = DisplayHandle::open(&context, Arc::new(other), &opener).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    assert!(context.open_handles().is_empty());
}

#[test]
fn checks_and_numbers_displays() {
    let zeros = Step::Reply(vec![0; 11]);
    let opener = ScriptedOpener::default()
        .with(DisplayPath::i2c(7), ScriptedTransport::new(vec![probe_ok(0x10), zeros]))
        .with(DisplayPath::i2c(3), ScriptedTransport::new(vec![probe_ok(0x10), vcp_reply(0xdd, 1, 0, 0)]))
        .with(DisplayPath::i2c(9), ScriptedTransport::new((0..10).map(|_| corrupt_reply())))
        .with(DisplayPath::i2c(5), ScriptedTransport::new(
            Some(probe_ok(0x10)).into_iter().chain((0..10).map(|_| Step::Null))
        ))
        .with(DisplayPath::i2c(11), ScriptedTransport::new(vec![probe_ok(0x10), probe_ok(0xdd), probe_ok(0x00)]));
    let context = context();
    let displays: Vec<_> = [7, 3, 9, 5, 11, 13].iter().map(|&bus| display(bus)).collect();

    let working = check_displays(&context, &displays, &opener);
    let paths: Vec<_> = working.iter().map(|display| *display.path()).collect();
    assert_eq!(paths, [DisplayPath::i2c(3), DisplayPath::i2c(5), DisplayPath::i2c(7), DisplayPath::i2c(11)]);
    for (i, display) in working.iter().enumerate() {
        assert_eq!(display.dispno(), i as i32 + 1);
        assert_eq!(display.state(), DisplayState::Working);
    }

    let sentinel = |i: usize| displays[i].unsupported_sentinel();
    assert_eq!(sentinel(0), Some(UnsupportedSentinel::AllZero));
    assert_eq!(sentinel(1), Some(UnsupportedSentinel::ExplicitFlag));
    assert_eq!(sentinel(3), Some(UnsupportedSentinel::NullResponse));
    assert_eq!(sentinel(4), None);
    assert!(displays[4].flags().contains(ddc_exchange::DisplayFlags::DOES_NOT_INDICATE_UNSUPPORTED));

    assert_eq!(displays[2].state(), DisplayState::Failed(InvalidReason::Invalid));
    assert_eq!(displays[5].state(), DisplayState::Failed(InvalidReason::Invalid));
    assert!(context.open_handles().is_empty());

    for path in opener.displays.keys() {
        assert_eq!(opener.transport(path).script().remaining(), 0, "{} has unused steps", path);
    }
}

#[test]
fn check_runs_once() {
    let path = DisplayPath::i2c(4);
    let transport = ScriptedTransport::new(vec![Step::ReadErr(libc::EBUSY)]);
    let context = context();
    let display = display(4);
    let mut handle = DisplayHandle::from_transport(&context, display.clone(), transport.clone()).unwrap();

    assert!(!check_communication(&mut handle));
    assert_eq!(display.state(), DisplayState::Failed(InvalidReason::Busy));

    // the cached result stands without touching the bus
    assert!(!check_communication(&mut handle));
    assert_eq!(transport.script().reads, 1);
    assert_eq!(*handle.path(), path);
    drop(handle);

    let opener = ScriptedOpener::default().with(path, transport);
    match DisplayHandle::open(&context, display, &opener) {
        Err(Error::InvalidDisplay { reason: InvalidReason::Busy, .. }) => (),
        res => panic!("unexpected result {:?}", res),
    }
}

#[test]
fn probe_skipped_when_sentinel_known() {
    let transport = ScriptedTransport::new(vec![probe_ok(0x10)]);
    let context = context();
    let display = display(4);
    display.latch_sentinel(UnsupportedSentinel::NullResponse);
    let mut handle = DisplayHandle::from_transport(&context, display.clone(), transport.clone()).unwrap();

    assert!(check_communication(&mut handle));
    assert_eq!(transport.script().reads, 1);
    assert_eq!(display.unsupported_sentinel(), Some(UnsupportedSentinel::NullResponse));
}

#[test]
fn sleep_adjustment_persists_across_sessions() {
    let path = DisplayPath::i2c(6);
    let mut edid = vec![0u8; 128];
    edid[8] = 0x10;
    edid[9] = 0xac;
    edid[12] = 0x42;
    let mut transport = ScriptedTransport::new(vec![probe_ok(0x10), vcp_reply(0xdd, 1, 0, 0)]);
    transport.edid = Some(edid);
    let opener = ScriptedOpener::default().with(path, transport);

    let display = Arc::new(DisplayRef::detect(path, &opener).unwrap());
    let key = display.persistence_key();
    assert_eq!(key, "10ac0000420000000000");

    let store = Arc::new(MemoryStore::default());
    store.save(&key, &DsaSnapshot {
        adjustment_factor: 2.0,
        check_interval: 4,
        total_adjustments: 1,
    }).unwrap();

    let mut config = Config::default();
    config.sleep.multiplier = 0.01;
    let context = Context::new(config).unwrap().with_store(store.clone());
    let working = check_displays(&context, &[display.clone()], &opener);
    assert_eq!(working.len(), 1);

    let summary = context.registry().summaries().remove(0);
    assert_eq!(summary.sleep.adjustment_factor, 2.0);
    assert_eq!(summary.sleep.check_interval, 4);

    let saved = store.restore(&key).unwrap().unwrap();
    assert_eq!(saved.adjustment_factor, 2.0);
    assert_eq!(saved.check_interval, 4);
    assert_eq!(opener.transport(&path).script().closed, 2);
}
