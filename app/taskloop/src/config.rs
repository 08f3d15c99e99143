// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use multitimer::{Idle, Rearm};

/// Largest read a task may ask for.
pub const MAX_READ: usize = 4096;

/// A task file that has been deserialized and checked.
///
/// Tasks and devices keep the order they were written in, which is also the
/// order tasks are added to the scheduler (and so the order in which tasks
/// with the same expiry fire).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub name: String,
    #[serde(default)]
    pub run: Run,
    pub devices: IndexMap<String, Device>,
    pub tasks: IndexMap<String, Task>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Run {
    #[serde(default)]
    pub idle: IdleKind,
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

fn default_max_idle_ms() -> u64 {
    1
}

impl Default for Run {
    fn default() -> Self {
        Self {
            idle: IdleKind::default(),
            max_idle_ms: default_max_idle_ms(),
            duration_ms: None,
        }
    }
}

impl Run {
    pub fn idle(&self) -> Idle {
        match self.idle {
            IdleKind::Spin => Idle::Spin,
            IdleKind::Yield => Idle::Yield,
            IdleKind::Sleep => Idle::Sleep {
                max_ms: self.max_idle_ms,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdleKind {
    Spin,
    Yield,
    #[default]
    Sleep,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Device {
    pub path: PathBuf,
    /// Create the file if it doesn't exist. Handy for trying a config out
    /// against plain files instead of device nodes.
    #[serde(default)]
    pub create: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Task {
    pub device: String,
    pub interval_ms: u64,
    /// First firing, relative to when the loop starts.
    #[serde(default)]
    pub offset_ms: u64,
    #[serde(default)]
    pub rearm: RearmKind,
    pub action: ActionSpec,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RearmKind {
    #[default]
    AfterFiring,
    AfterDeadline,
}

impl From<RearmKind> for Rearm {
    fn from(r: RearmKind) -> Self {
        match r {
            RearmKind::AfterFiring => Rearm::AfterFiring,
            RearmKind::AfterDeadline => Rearm::AfterDeadline,
        }
    }
}

/// What a task does to its device each time it fires.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub enum ActionSpec {
    /// Write the bytes of this string.
    Write(String),
    /// Write these bytes as given.
    Bytes(Vec<u8>),
    /// Read up to this many bytes and log them.
    Read(usize),
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text)?;
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("no tasks defined");
        }
        for (name, task) in &self.tasks {
            if !self.devices.contains_key(&task.device) {
                bail!("task {name} uses undefined device {:?}", task.device);
            }
            match &task.action {
                ActionSpec::Write(s) if s.is_empty() => {
                    bail!("task {name} writes nothing");
                }
                ActionSpec::Bytes(b) if b.is_empty() => {
                    bail!("task {name} writes nothing");
                }
                ActionSpec::Read(n) if *n == 0 || *n > MAX_READ => {
                    bail!("task {name}: read length must be 1..={MAX_READ}");
                }
                _ => (),
            }
        }
        Ok(())
    }
}
