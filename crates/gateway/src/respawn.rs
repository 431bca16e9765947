//! Decide how the gateway process gets replaced on restart, and carry the
//! decision out.

use std::{
    ffi::OsString,
    io,
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
};

use tracing::{info, warn};

use clawport_common::env::{flag_with, is_present_with};

/// Opt-out: never spawn a successor, restart in-process instead.
pub const NO_RESPAWN_ENV: &str = "CLAWPORT_NO_RESPAWN";

/// Explicitly mark the process as owned by a supervisor.
pub const SUPERVISED_ENV: &str = "CLAWPORT_SUPERVISED";

/// Variables launchd and systemd inject into the services they manage.
pub const SUPERVISOR_MARKERS: &[&str] = &[
    "LAUNCH_JOB_LABEL",
    "LAUNCH_JOB_NAME",
    "INVOCATION_ID",
    "SYSTEMD_EXEC_PID",
];

/// Outcome of one respawn attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespawnDecision {
    /// Respawn is switched off; nothing was attempted.
    Disabled,
    /// A supervisor owns the process and will relaunch it after we exit.
    Supervised,
    /// A detached successor is running.
    Spawned { pid: u32 },
    /// A spawn was attempted and did not happen.
    Failed { detail: String },
}

impl RespawnDecision {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Supervised => "supervised",
            Self::Spawned { .. } => "spawned",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What the environment asks for, before any action is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnMode {
    Disabled,
    Supervised,
    Spawn,
}

/// Classify the process environment. Pure over `lookup`.
pub fn classify(lookup: impl Fn(&str) -> Option<String>) -> RespawnMode {
    if flag_with(&lookup, NO_RESPAWN_ENV) {
        return RespawnMode::Disabled;
    }
    if flag_with(&lookup, SUPERVISED_ENV)
        || SUPERVISOR_MARKERS
            .iter()
            .any(|name| is_present_with(&lookup, name))
    {
        return RespawnMode::Supervised;
    }
    RespawnMode::Spawn
}

/// Executable and arguments for the successor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl SpawnPlan {
    /// Re-run the current executable with the current arguments.
    pub fn current() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
        })
    }
}

/// Launches a process that outlives its parent.
pub trait ProcessSpawner: Send + Sync {
    fn spawn_detached(&self, plan: &SpawnPlan) -> io::Result<u32>;
}

/// Spawns with inherited stdio in a separate process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSpawner;

impl ProcessSpawner for DetachedSpawner {
    fn spawn_detached(&self, plan: &SpawnPlan) -> io::Result<u32> {
        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own group: a terminal Ctrl-C or the parent's exit must not reach it.
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        // The `Child` is dropped without waiting; std neither kills nor reaps it.
        let child = cmd.spawn()?;
        Ok(child.id())
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
type PlanSource = Arc<dyn Fn() -> io::Result<SpawnPlan> + Send + Sync>;

/// Carries out the respawn decision. Callers never spawn on their own.
pub trait Respawner: Send + Sync {
    fn decide_and_act(&self) -> RespawnDecision;
}

/// Environment-driven [`Respawner`].
#[derive(Clone)]
pub struct RespawnEngine {
    lookup: EnvLookup,
    plan: PlanSource,
    spawner: Arc<dyn ProcessSpawner>,
}

impl Default for RespawnEngine {
    fn default() -> Self {
        Self::from_process_env()
    }
}

impl RespawnEngine {
    /// Read the real environment and relaunch the current executable.
    #[must_use]
    pub fn from_process_env() -> Self {
        Self {
            lookup: Arc::new(|name: &str| std::env::var(name).ok()),
            plan: Arc::new(SpawnPlan::current),
            spawner: Arc::new(DetachedSpawner),
        }
    }

    #[must_use]
    pub fn with_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.lookup = Arc::new(lookup);
        self
    }

    #[must_use]
    pub fn with_plan(mut self, plan: SpawnPlan) -> Self {
        self.plan = Arc::new(move || Ok(plan.clone()));
        self
    }

    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// The decision the current environment would produce, without acting.
    #[must_use]
    pub fn mode(&self) -> RespawnMode {
        classify(|name| (self.lookup)(name))
    }

    fn spawn(&self) -> RespawnDecision {
        let plan = match (self.plan)() {
            Ok(plan) => plan,
            Err(e) => {
                return RespawnDecision::Failed {
                    detail: format!("cannot resolve current executable: {e}"),
                };
            },
        };
        match self.spawner.spawn_detached(&plan) {
            Ok(pid) => {
                info!(
                    pid,
                    exe = %plan.program.display(),
                    args = ?plan.args,
                    "spawned detached successor"
                );
                RespawnDecision::Spawned { pid }
            },
            Err(e) => RespawnDecision::Failed {
                detail: e.to_string(),
            },
        }
    }
}

impl Respawner for RespawnEngine {
    fn decide_and_act(&self) -> RespawnDecision {
        let decision = match self.mode() {
            RespawnMode::Disabled => RespawnDecision::Disabled,
            RespawnMode::Supervised => RespawnDecision::Supervised,
            RespawnMode::Spawn => self.spawn(),
        };
        if let RespawnDecision::Failed { detail } = &decision {
            warn!(detail = %detail, "failed to spawn successor process");
        }
        decision
    }
}
