#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ddc_exchange::packet::{encode_reply, null_reply};
use ddc_exchange::{
    Config, Context, DisplayPath, DisplayRef, Opener, Registry, SleepEvent, SleepPolicy, Transport,
};

/// What the simulated display does on the next bus operation.
#[derive(Clone, Debug)]
pub enum Step {
    Reply(Vec<u8>),
    Null,
    ReadErr(i32),
    WriteErr(i32),
    WriteOk,
}

/// Builds a Get VCP Feature reply frame.
pub fn vcp_reply(code: u8, rc: u8, max: u16, cur: u16) -> Step {
    Step::Reply(encode_reply(0x6e, 0x02, &[rc, code, 0x00, (max >> 8) as u8, max as u8, (cur >> 8) as u8, cur as u8]))
}

/// Builds a capabilities reply fragment.
pub fn caps_reply(offset: u16, data: &[u8]) -> Step {
    let mut payload = vec![(offset >> 8) as u8, offset as u8];
    payload.extend_from_slice(data);
    Step::Reply(encode_reply(0x6e, 0xe3, &payload))
}

/// Builds a table read reply fragment.
pub fn table_reply(offset: u16, data: &[u8]) -> Step {
    let mut payload = vec![(offset >> 8) as u8, offset as u8];
    payload.extend_from_slice(data);
    Step::Reply(encode_reply(0x6e, 0xe4, &payload))
}

/// A reply frame damaged in transit.
pub fn corrupt_reply() -> Step {
    match vcp_reply(0x10, 0, 100, 50) {
        Step::Reply(mut frame) => {
            let last = frame.len() - 1;
            frame[last] ^= 0xff;
            Step::Reply(frame)
        },
        step => step,
    }
}

#[derive(Debug, Default)]
pub struct Script {
    pub steps: VecDeque<Step>,
    pub writes: Vec<Vec<u8>>,
    pub reads: usize,
    pub closed: usize,
}

impl Script {
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

/// Replays a scripted conversation with one display.
#[derive(Clone, Debug)]
pub struct ScriptedTransport {
    pub script: Arc<Mutex<Script>>,
    pub disconnected: Arc<AtomicBool>,
    pub edid: Option<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new<I: IntoIterator<Item = Step>>(steps: I) -> Self {
        ScriptedTransport {
            script: Arc::new(Mutex::new(Script {
                steps: steps.into_iter().collect(),
                ..Default::default()
            })),
            disconnected: Default::default(),
            edid: None,
        }
    }

    pub fn script(&self) -> ::std::sync::MutexGuard<Script> {
        self.script.lock().unwrap()
    }

    pub fn push<I: IntoIterator<Item = Step>>(&self, steps: I) {
        self.script().steps.extend(steps);
    }
}

impl Transport for ScriptedTransport {
    fn set_target_address(&mut self, _address: u16) -> io::Result<()> {
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut script = self.script();
        script.writes.push(data.to_vec());
        match script.steps.front().cloned() {
            Some(Step::WriteErr(errno)) => {
                script.steps.pop_front();
                Err(io::Error::from_raw_os_error(errno))
            },
            Some(Step::WriteOk) => {
                script.steps.pop_front();
                Ok(())
            },
            _ => Ok(()),
        }
    }

    fn read(&mut self, data: &mut [u8], _bytewise: bool) -> io::Result<usize> {
        let mut script = self.script();
        script.reads += 1;
        let frame = match script.steps.pop_front() {
            Some(Step::Reply(frame)) => frame,
            Some(Step::Null) => null_reply(),
            Some(Step::ReadErr(errno)) => return Err(io::Error::from_raw_os_error(errno)),
            step => panic!("unexpected read, next step {:?}", step),
        };

        let len = ::std::cmp::min(frame.len(), data.len());
        data[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    fn read_edid(&mut self, data: &mut [u8]) -> io::Result<usize> {
        match self.edid {
            Some(ref edid) => {
                let len = ::std::cmp::min(edid.len(), data.len());
                data[..len].copy_from_slice(&edid[..len]);
                Ok(len)
            },
            None => Err(io::Error::from_raw_os_error(libc::ENXIO)),
        }
    }

    fn is_disconnected(&mut self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> io::Result<()> {
        self.script().closed += 1;
        Ok(())
    }
}

/// Hands out scripted transports by path.
#[derive(Debug, Default)]
pub struct ScriptedOpener {
    pub displays: HashMap<DisplayPath, ScriptedTransport>,
    pub missing: Vec<DisplayPath>,
}

impl ScriptedOpener {
    pub fn with(mut self, path: DisplayPath, transport: ScriptedTransport) -> Self {
        self.displays.insert(path, transport);
        self
    }

    pub fn transport(&self, path: &DisplayPath) -> &ScriptedTransport {
        &self.displays[path]
    }
}

impl Opener for ScriptedOpener {
    type Transport = ScriptedTransport;

    fn open(&self, path: &DisplayPath) -> io::Result<ScriptedTransport> {
        self.displays.get(path).cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn is_disconnected(&self, path: &DisplayPath) -> bool {
        self.missing.contains(path)
    }
}

/// A sleep policy that never waits.
#[derive(Debug, Default)]
pub struct NoSleep;

impl SleepPolicy for NoSleep {
    fn begin_exchange(&self, _display: &DisplayPath) { }

    fn record_outcome(&self, _display: &DisplayPath, _ok: bool) { }

    fn note_retry(&self, _display: &DisplayPath) { }

    fn adjusted_delay(&self, _display: &DisplayPath, _event: SleepEvent) -> Duration {
        Duration::from_millis(0)
    }
}

/// A context with default retry ceilings that never sleeps.
pub fn context() -> Context {
    context_with(Config::default())
}

pub fn context_with(config: Config) -> Context {
    let registry = Arc::new(Registry::new(config.registry_defaults()));
    Context::from_parts(config, registry.clone(), registry, Arc::new(NoSleep))
}

pub fn display(bus: u32) -> Arc<DisplayRef> {
    Arc::new(DisplayRef::new(DisplayPath::i2c(bus), None))
}
