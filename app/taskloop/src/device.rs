// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device handles and the actions that use them.
//!
//! Every device named in the config is opened once, up front, and shared by
//! all the tasks that use it. Tasks run one at a time on the scheduler's
//! thread, so the sharing is `Rc<RefCell<_>>` rather than anything that
//! locks.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::rc::Rc;

use anyhow::{Context, Result};
use indexmap::IndexMap;

use multitimer::{Action, TimerTask};

use crate::config::{ActionSpec, Config};

/// Anything a task can read from or write to.
pub trait Port: Read + Write {}

impl<T: Read + Write> Port for T {}

pub type SharedPort = Rc<RefCell<Box<dyn Port>>>;

#[derive(Default)]
pub struct Devices {
    ports: IndexMap<String, SharedPort>,
}

impl Devices {
    /// Opens every device in `cfg` for reading and writing.
    pub fn open(cfg: &Config) -> Result<Self> {
        let mut devices = Self::default();
        for (name, dev) in &cfg.devices {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(dev.create)
                .open(&dev.path)
                .with_context(|| {
                    format!("opening device {name} ({})", dev.path.display())
                })?;
            log::debug!("opened {name} at {}", dev.path.display());
            devices.insert(name.clone(), file);
        }
        Ok(devices)
    }

    /// Stands in for every device in `cfg` without touching the filesystem.
    pub fn dry_run(cfg: &Config) -> Self {
        let mut devices = Self::default();
        for name in cfg.devices.keys() {
            devices.insert(name.clone(), DryRun);
        }
        devices
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        port: impl Port + 'static,
    ) {
        self.ports
            .insert(name.into(), Rc::new(RefCell::new(Box::new(port))));
    }

    pub fn get(&self, name: &str) -> Option<SharedPort> {
        self.ports.get(name).cloned()
    }
}

/// Accepts every write and reads back zeros.
struct DryRun;

impl Read for DryRun {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }
}

impl Write for DryRun {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Performs one configured I/O operation on a device each time it fires.
///
/// I/O errors are logged and otherwise ignored; the task stays on schedule
/// and tries again next time.
pub struct DeviceAction {
    device: String,
    port: SharedPort,
    op: ActionSpec,
    buf: Vec<u8>,
}

impl DeviceAction {
    pub fn new(
        device: impl Into<String>,
        port: SharedPort,
        op: ActionSpec,
    ) -> Self {
        Self {
            device: device.into(),
            port,
            op,
            buf: Vec::new(),
        }
    }
}

impl Action for DeviceAction {
    fn fire(&mut self, task: &TimerTask) {
        let mut port = self.port.borrow_mut();
        match &self.op {
            ActionSpec::Write(text) => {
                match write_all(&mut **port, text.as_bytes()) {
                    Ok(()) => log::info!(
                        "{}: wrote {text:?} to {}",
                        task.label(),
                        self.device,
                    ),
                    Err(e) => log::warn!(
                        "{}: write to {} failed: {e}",
                        task.label(),
                        self.device,
                    ),
                }
            }
            ActionSpec::Bytes(bytes) => match write_all(&mut **port, bytes) {
                Ok(()) => log::info!(
                    "{}: wrote {bytes:02x?} to {}",
                    task.label(),
                    self.device,
                ),
                Err(e) => log::warn!(
                    "{}: write to {} failed: {e}",
                    task.label(),
                    self.device,
                ),
            },
            ActionSpec::Read(len) => {
                self.buf.resize(*len, 0);
                match port.read(&mut self.buf) {
                    Ok(n) => log::info!(
                        "{}: read {:02x?} from {}",
                        task.label(),
                        &self.buf[..n],
                        self.device,
                    ),
                    Err(e) => log::warn!(
                        "{}: read from {} failed: {e}",
                        task.label(),
                        self.device,
                    ),
                }
            }
        }
    }
}

fn write_all(port: &mut dyn Port, bytes: &[u8]) -> io::Result<()> {
    port.write_all(bytes)?;
    port.flush()
}
