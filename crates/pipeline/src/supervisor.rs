//! External process supervision.
//!
//! Every encoder/prober process is spawned through [`ProcessSupervisor`],
//! which records its pid against the owning job the moment it is known. On
//! cancellation the supervisor runs a kill cascade:
//!
//! 1. SIGTERM to every registered pid of the job
//! 2. a short grace delay
//! 3. SIGKILL to the registered pids and all of their descendants, including
//!    those seen before SIGTERM that have since been reparented
//! 4. a fallback scan of encoder-named OS processes whose command line carries
//!    the job tag or one of the job's paths, or whose cwd lies inside them
//! 5. a verification scan; survivors are logged, never raised
//!
//! Each step runs regardless of the previous one, so the cascade is safe to
//! apply twice.

use crate::config::SupervisorConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind,
};
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Prefix of the per-job tag embedded in encoder invocations
pub const JOB_TAG_PREFIX: &str = "hls-forge:";

/// How many times to poll a fresh child for its pid
const PID_POLL_ATTEMPTS: u32 = 10;
const PID_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Error type for spawning supervised processes
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process for {program} exited before reporting a pid")]
    NoPid { program: String },

    #[error("Job {0} is being terminated; refusing to start new processes")]
    JobTerminated(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal supervision failures. These are logged, never returned to callers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to kill all processes for job {job_id}: {residual} still running")]
    KillFailure { job_id: String, residual: usize },
}

/// A program plus an explicit argument vector. Never run through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Arguments as lossy UTF-8, mostly for logging and tests
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Command with null stdin, piped stdout/stderr and kill-on-drop
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Why a process was spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessLabel {
    Probe,
    Encode,
    Thumbnail,
    Storyboard,
    Audio,
    Captions,
}

impl std::fmt::Display for ProcessLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessLabel::Probe => "probe",
            ProcessLabel::Encode => "encode",
            ProcessLabel::Thumbnail => "thumbnail",
            ProcessLabel::Storyboard => "storyboard",
            ProcessLabel::Audio => "audio",
            ProcessLabel::Captions => "captions",
        };
        f.write_str(s)
    }
}

/// One registered process
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub job_id: String,
    pub label: ProcessLabel,
    pub started_at: Instant,
}

/// Termination signal strength
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Cooperative (SIGTERM)
    Term,
    /// Forceful (SIGKILL)
    Kill,
}

/// A row of the OS process table
#[derive(Debug, Clone, PartialEq)]
pub struct OsProcess {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// False for zombies and dead entries
    pub alive: bool,
}

/// Access to the OS process table.
///
/// The real implementation is backed by sysinfo; tests substitute a fake.
pub trait ProcessTable: Send + Sync {
    /// Enumerate all processes
    fn snapshot(&self) -> Vec<OsProcess>;

    /// Deliver a signal. Returns true when the signal was sent to a live process.
    fn signal(&self, pid: u32, signal: KillSignal) -> bool;
}

/// [`ProcessTable`] backed by `sysinfo`
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn is_live(status: ProcessStatus) -> bool {
    !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&self) -> Vec<OsProcess> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );

        system
            .processes()
            .values()
            .map(|p| OsProcess {
                pid: p.pid().as_u32(),
                parent: p.parent().map(|pp| pp.as_u32()),
                name: p.name().to_string_lossy().into_owned(),
                cmd: p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect(),
                cwd: p.cwd().map(Path::to_path_buf),
                alive: is_live(p.status()),
            })
            .collect()
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> bool {
        let mut system = self.system.lock();
        let spid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[spid]),
            ProcessRefreshKind::new(),
        );

        match system.process(spid) {
            Some(process) if is_live(process.status()) => match signal {
                // Platforms without SIGTERM fall back to a hard kill
                KillSignal::Term => process
                    .kill_with(Signal::Term)
                    .unwrap_or_else(|| process.kill()),
                KillSignal::Kill => process.kill(),
            },
            _ => false,
        }
    }
}

/// Outcome of a kill cascade for one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KillReport {
    pub job_id: String,
    /// Processes that received a signal
    pub signaled: usize,
    /// Signaled processes confirmed gone after verification
    pub killed: usize,
    /// Matching processes still alive after verification
    pub residual: usize,
}

/// Timing and matching knobs for the kill cascade
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub grace: Duration,
    pub verify_delay: Duration,
    pub encoder_names: Vec<String>,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            grace: Duration::from_millis(cfg.grace_ms),
            verify_delay: Duration::from_millis(cfg.verify_ms),
            encoder_names: cfg.encoder_process_names.clone(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

/// What identifies a job's processes when no pid was registered
#[derive(Debug, Clone, Default)]
struct JobSignature {
    paths: Vec<PathBuf>,
}

#[derive(Default)]
struct Registry {
    by_job: HashMap<String, HashSet<u32>>,
    by_pid: HashMap<u32, ProcessRecord>,
    signatures: HashMap<String, JobSignature>,
    terminated: HashSet<String>,
    /// Descendants captured before a job's processes were sent SIGTERM
    doomed: HashMap<String, HashSet<u32>>,
}

impl Registry {
    fn remove_pid(&mut self, pid: u32) -> Option<ProcessRecord> {
        let record = self.by_pid.remove(&pid)?;
        if let Some(pids) = self.by_job.get_mut(&record.job_id) {
            pids.remove(&pid);
            if pids.is_empty() {
                self.by_job.remove(&record.job_id);
            }
        }
        Some(record)
    }

    fn remove_job_pid(&mut self, job_id: &str, pid: u32) -> Option<ProcessRecord> {
        match self.by_pid.get(&pid) {
            Some(record) if record.job_id == job_id => self.remove_pid(pid),
            _ => None,
        }
    }
}

/// Registry of live external processes plus the kill cascade.
///
/// Shared by reference across jobs; all registry access is behind one mutex.
pub struct ProcessSupervisor {
    table: Arc<dyn ProcessTable>,
    registry: Mutex<Registry>,
    settings: SupervisorSettings,
}

impl ProcessSupervisor {
    pub fn new(table: Arc<dyn ProcessTable>, settings: SupervisorSettings) -> Self {
        Self {
            table,
            registry: Mutex::new(Registry::default()),
            settings,
        }
    }

    /// Supervisor over the real OS process table
    pub fn from_config(cfg: &SupervisorConfig) -> Self {
        Self::new(Arc::new(SysinfoProcessTable::new()), cfg.into())
    }

    /// Tag embedded in every encoder invocation for a job
    pub fn job_tag(job_id: &str) -> String {
        format!("{}{}", JOB_TAG_PREFIX, job_id)
    }

    /// Record the output/temp paths used to recognise a job's strays
    pub fn set_signature(&self, job_id: &str, paths: Vec<PathBuf>) {
        self.registry
            .lock()
            .signatures
            .insert(job_id.to_string(), JobSignature { paths });
    }

    /// Register a pid against a job.
    ///
    /// Returns false when the job is already being terminated; the record is
    /// kept anyway so the cascade still finds it, but the caller should kill
    /// the process straight away.
    pub fn register(&self, job_id: &str, pid: u32, label: ProcessLabel) -> bool {
        let mut registry = self.registry.lock();
        registry.by_pid.insert(
            pid,
            ProcessRecord {
                pid,
                job_id: job_id.to_string(),
                label,
                started_at: Instant::now(),
            },
        );
        registry
            .by_job
            .entry(job_id.to_string())
            .or_default()
            .insert(pid);

        debug!(job_id, pid, label = %label, "Registered process");
        !registry.terminated.contains(job_id)
    }

    /// Remove a pid after normal exit.
    ///
    /// A record owned by another job (a reused pid) is left in place.
    pub fn unregister(&self, job_id: &str, pid: u32) -> Option<ProcessRecord> {
        let record = self.registry.lock().remove_job_pid(job_id, pid);
        if let Some(ref r) = record {
            debug!(job_id, pid, label = %r.label, "Unregistered process");
        }
        record
    }

    pub fn registered_pids(&self, job_id: &str) -> Vec<u32> {
        let registry = self.registry.lock();
        let mut pids: Vec<u32> = registry
            .by_job
            .get(job_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        pids.sort_unstable();
        pids
    }

    pub fn records(&self) -> Vec<ProcessRecord> {
        self.registry.lock().by_pid.values().cloned().collect()
    }

    pub fn is_terminated(&self, job_id: &str) -> bool {
        self.registry.lock().terminated.contains(job_id)
    }

    /// Mark a job as terminating and send SIGTERM to its registered pids.
    ///
    /// Synchronous so callers can signal without awaiting the full cascade.
    /// Returns the number of processes signaled.
    pub fn begin_termination(&self, job_id: &str) -> usize {
        let pids: HashSet<u32> = {
            let mut registry = self.registry.lock();
            registry.terminated.insert(job_id.to_string());
            registry.by_job.get(job_id).cloned().unwrap_or_default()
        };

        if !pids.is_empty() {
            let descendants = descendants_of(&self.table.snapshot(), &pids);
            self.remember_descendants(job_id, descendants);
        }

        let signaled = pids
            .iter()
            .filter(|pid| self.table.signal(**pid, KillSignal::Term))
            .count();
        if signaled > 0 {
            info!(job_id, signaled, "Sent SIGTERM to job processes");
        }
        signaled
    }

    /// Run the full kill cascade for one job. Never fails; see [`KillReport`].
    pub async fn kill_job(&self, job_id: &str) -> KillReport {
        let (registered, signature) = {
            let mut registry = self.registry.lock();
            registry.terminated.insert(job_id.to_string());
            let pids: HashSet<u32> = registry.by_job.get(job_id).cloned().unwrap_or_default();
            let sig = registry.signatures.get(job_id).cloned().unwrap_or_default();
            (pids, sig)
        };
        let tag = Self::job_tag(job_id);
        let mut signaled: HashSet<u32> = HashSet::new();

        // children are reparented once their parent exits on SIGTERM
        if !registered.is_empty() {
            let before = self.snapshot().await;
            self.remember_descendants(job_id, descendants_of(&before, &registered));
        }
        let early = self
            .registry
            .lock()
            .doomed
            .remove(job_id)
            .unwrap_or_default();

        // 1. cooperative
        for pid in &registered {
            if self.table.signal(*pid, KillSignal::Term) {
                signaled.insert(*pid);
            }
        }

        // 2. grace
        if !registered.is_empty() {
            tokio::time::sleep(self.settings.grace).await;
        }

        // 3. forceful, registered pids plus descendants
        let snapshot = self.snapshot().await;
        let mut targets = registered.clone();
        targets.extend(descendants_of(&snapshot, &registered));
        targets.extend(early.iter().copied());
        targets.extend(descendants_of(&snapshot, &early));
        for pid in &targets {
            if self.table.signal(*pid, KillSignal::Kill) {
                signaled.insert(*pid);
            }
        }

        // 4. fallback discovery by signature
        let strays: HashSet<u32> = snapshot
            .iter()
            .filter(|p| p.alive && !targets.contains(&p.pid))
            .filter(|p| self.is_encoder(p) && matches_signature(p, &tag, &signature.paths))
            .map(|p| p.pid)
            .collect();
        let mut fallback = strays.clone();
        fallback.extend(descendants_of(&snapshot, &strays));
        for pid in &fallback {
            if !targets.contains(pid) && self.table.signal(*pid, KillSignal::Kill) {
                signaled.insert(*pid);
            }
        }
        if !strays.is_empty() {
            warn!(
                job_id,
                count = strays.len(),
                "Killed unregistered encoder processes matching job signature"
            );
        }

        // 5. verification
        if !signaled.is_empty() {
            tokio::time::sleep(self.settings.verify_delay).await;
        }
        let after = self.snapshot().await;
        let alive: HashSet<u32> = after.iter().filter(|p| p.alive).map(|p| p.pid).collect();

        let residual_pids: HashSet<u32> = after
            .iter()
            .filter(|p| p.alive)
            .filter(|p| {
                signaled.contains(&p.pid)
                    || targets.contains(&p.pid)
                    || (self.is_encoder(p) && matches_signature(p, &tag, &signature.paths))
            })
            .map(|p| p.pid)
            .collect();
        let killed = signaled.iter().filter(|pid| !alive.contains(pid)).count();

        {
            let mut registry = self.registry.lock();
            for pid in &registered {
                if !residual_pids.contains(pid) {
                    registry.remove_pid(*pid);
                }
            }
        }

        let report = KillReport {
            job_id: job_id.to_string(),
            signaled: signaled.len(),
            killed,
            residual: residual_pids.len(),
        };

        if report.residual > 0 {
            let err = SupervisorError::KillFailure {
                job_id: job_id.to_string(),
                residual: report.residual,
            };
            warn!(job_id, residual = report.residual, error = %err, "Kill cascade left processes behind");
        } else {
            info!(job_id, killed = report.killed, "Kill cascade complete");
        }
        report
    }

    /// Run the cascade for every known job, then clear the registry
    pub async fn kill_all(&self) -> Vec<KillReport> {
        let job_ids: Vec<String> = {
            let registry = self.registry.lock();
            let mut ids: HashSet<String> = registry.by_job.keys().cloned().collect();
            ids.extend(registry.signatures.keys().cloned());
            ids.extend(registry.doomed.keys().cloned());
            let mut ids: Vec<String> = ids.into_iter().collect();
            ids.sort();
            ids
        };

        let mut reports = Vec::with_capacity(job_ids.len());
        for job_id in &job_ids {
            reports.push(self.kill_job(job_id).await);
        }

        let mut registry = self.registry.lock();
        registry.by_job.clear();
        registry.by_pid.clear();
        registry.signatures.clear();
        registry.doomed.clear();
        registry.terminated.extend(job_ids);
        reports
    }

    /// Drop all bookkeeping for a finished job
    pub fn forget_job(&self, job_id: &str) {
        let mut registry = self.registry.lock();
        if let Some(pids) = registry.by_job.remove(job_id) {
            for pid in pids {
                registry.by_pid.remove(&pid);
            }
        }
        registry.signatures.remove(job_id);
        registry.doomed.remove(job_id);
        registry.terminated.remove(job_id);
    }

    fn remember_descendants(&self, job_id: &str, pids: HashSet<u32>) {
        if pids.is_empty() {
            return;
        }
        self.registry
            .lock()
            .doomed
            .entry(job_id.to_string())
            .or_default()
            .extend(pids);
    }

    /// Spawn an invocation and register it against the job.
    ///
    /// The pid is registered before this returns. If the job is already being
    /// terminated, the child is killed and [`SpawnError::JobTerminated`] is
    /// returned.
    pub async fn spawn(
        self: &Arc<Self>,
        job_id: &str,
        label: ProcessLabel,
        invocation: &Invocation,
    ) -> Result<SupervisedChild, SpawnError> {
        let program = invocation.program().display().to_string();
        if self.is_terminated(job_id) {
            return Err(SpawnError::JobTerminated(job_id.to_string()));
        }

        let mut child = invocation
            .to_command()
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut pid = child.id();
        let mut attempts = 0;
        while pid.is_none() && attempts < PID_POLL_ATTEMPTS {
            tokio::time::sleep(PID_POLL_INTERVAL).await;
            pid = child.id();
            attempts += 1;
        }
        let pid = match pid {
            Some(pid) => pid,
            None => {
                let _ = child.wait().await;
                return Err(SpawnError::NoPid { program });
            }
        };

        let accepted = self.register(job_id, pid, label);
        let guard = Registration {
            supervisor: Arc::clone(self),
            job_id: job_id.to_string(),
            pid,
        };
        if !accepted {
            warn!(job_id, pid, label = %label, "Job terminated during spawn; killing new process");
            let _ = child.start_kill();
            let _ = child.wait().await;
            drop(guard);
            return Err(SpawnError::JobTerminated(job_id.to_string()));
        }

        debug!(job_id, pid, program = %program, args = ?invocation.args_lossy(), "Spawned process");
        Ok(SupervisedChild {
            child,
            pid,
            _guard: guard,
        })
    }

    /// Spawn, wait and collect output
    pub async fn run_to_completion(
        self: &Arc<Self>,
        job_id: &str,
        label: ProcessLabel,
        invocation: &Invocation,
    ) -> Result<Output, SpawnError> {
        let child = self.spawn(job_id, label, invocation).await?;
        Ok(child.wait_with_output().await?)
    }

    fn is_encoder(&self, process: &OsProcess) -> bool {
        let exe_stem = process
            .cmd
            .first()
            .and_then(|c| Path::new(c).file_stem())
            .map(|s| s.to_string_lossy().to_lowercase());
        let name = normalize_name(&process.name);
        self.settings.encoder_names.iter().any(|n| {
            let n = normalize_name(n);
            name == n || exe_stem.as_deref() == Some(n.as_str())
        })
    }

    async fn snapshot(&self) -> Vec<OsProcess> {
        let table = Arc::clone(&self.table);
        tokio::task::spawn_blocking(move || table.snapshot())
            .await
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("ProcessSupervisor")
            .field("processes", &registry.by_pid.len())
            .field("jobs", &registry.by_job.len())
            .field("settings", &self.settings)
            .finish()
    }
}

fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
}

fn matches_signature(process: &OsProcess, tag: &str, paths: &[PathBuf]) -> bool {
    if process.cmd.iter().any(|arg| arg.contains(tag)) {
        return true;
    }
    paths.iter().filter(|p| !p.as_os_str().is_empty()).any(|path| {
        let needle = path.to_string_lossy();
        process.cmd.iter().any(|arg| arg.contains(needle.as_ref()))
            || process.cwd.as_deref().is_some_and(|cwd| cwd.starts_with(path))
    })
}

/// All transitive children of `roots`
fn descendants_of(snapshot: &[OsProcess], roots: &HashSet<u32>) -> HashSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in snapshot {
        if let Some(parent) = p.parent {
            children.entry(parent).or_default().push(p.pid);
        }
    }

    let mut found = HashSet::new();
    let mut stack: Vec<u32> = roots.iter().copied().collect();
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if !roots.contains(kid) && found.insert(*kid) {
                    stack.push(*kid);
                }
            }
        }
    }
    found
}

/// Unregisters its pid when dropped
struct Registration {
    supervisor: Arc<ProcessSupervisor>,
    job_id: String,
    pid: u32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.supervisor.unregister(&self.job_id, self.pid);
    }
}

/// A running child that stays registered until it is waited on or dropped
pub struct SupervisedChild {
    child: Child,
    pid: u32,
    _guard: Registration,
}

impl SupervisedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub async fn wait_with_output(self) -> std::io::Result<Output> {
        let SupervisedChild { child, _guard, .. } = self;
        child.wait_with_output().await
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeProcessTable;
    use super::*;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            grace: Duration::from_millis(10),
            verify_delay: Duration::from_millis(10),
            encoder_names: vec!["ffmpeg".to_string(), "ffprobe".to_string()],
        }
    }

    fn supervisor_with(table: &Arc<FakeProcessTable>) -> ProcessSupervisor {
        ProcessSupervisor::new(table.clone() as Arc<dyn ProcessTable>, settings())
    }

    #[test]
    fn test_register_and_unregister_maintain_both_indexes() {
        let table = Arc::new(FakeProcessTable::default());
        let sup = supervisor_with(&table);

        assert!(sup.register("job-a", 100, ProcessLabel::Encode));
        assert!(sup.register("job-a", 101, ProcessLabel::Encode));
        assert!(sup.register("job-b", 200, ProcessLabel::Probe));

        assert_eq!(sup.registered_pids("job-a"), vec![100, 101]);
        assert_eq!(sup.records().len(), 3);

        let rec = sup.unregister("job-a", 100).unwrap();
        assert_eq!(rec.job_id, "job-a");
        assert_eq!(rec.label, ProcessLabel::Encode);
        assert_eq!(sup.registered_pids("job-a"), vec![101]);
        assert!(sup.unregister("job-a", 100).is_none());
    }

    #[test]
    fn test_unregister_ignores_pid_owned_by_another_job() {
        let table = Arc::new(FakeProcessTable::default());
        let sup = supervisor_with(&table);

        // pid 100 finished under job-a and was reused by job-b
        sup.register("job-b", 100, ProcessLabel::Encode);

        assert!(sup.unregister("job-a", 100).is_none());
        assert_eq!(sup.registered_pids("job-b"), vec![100]);
        assert!(sup.unregister("job-b", 100).is_some());
    }

    #[tokio::test]
    async fn test_children_of_parent_exiting_on_sigterm_are_killed() {
        let table = Arc::new(FakeProcessTable::default());
        table.add(100, Some(1), "sh", &["sh", "-c", "helper & wait"]);
        table.add(150, Some(100), "helper", &["helper"]);
        let sup = supervisor_with(&table);
        sup.register("job-a", 100, ProcessLabel::Encode);

        let report = sup.kill_job("job-a").await;

        assert!(!table.is_alive(100));
        assert_eq!(table.signals_for(150), vec![KillSignal::Kill]);
        assert!(!table.is_alive(150));
        assert_eq!(report.killed, 2);
        assert_eq!(report.residual, 0);
    }

    #[tokio::test]
    async fn test_begin_termination_remembers_children_for_cascade() {
        let table = Arc::new(FakeProcessTable::default());
        table.add(100, Some(1), "ffmpeg", &["ffmpeg"]);
        table.add(150, Some(100), "helper", &["helper"]);
        table.make_unkillable(150);
        let sup = supervisor_with(&table);
        sup.register("job-a", 100, ProcessLabel::Encode);

        assert_eq!(sup.begin_termination("job-a"), 1);
        assert!(!table.is_alive(100));
        sup.unregister("job-a", 100);

        // the helper is now parented to init and no longer registered
        let report = sup.kill_job("job-a").await;
        assert_eq!(table.signals_for(150), vec![KillSignal::Kill]);
        assert_eq!(report.residual, 1, "surviving helper must be reported");
    }

    #[tokio::test]
    async fn test_cascade_escalates_and_reaches_descendants() {
        let table = Arc::new(FakeProcessTable::default());
        table.add(100, Some(1), "ffmpeg", &["ffmpeg", "-i", "in.mp4"]);
        table.ignore_term(100);
        table.add(150, Some(100), "ffmpeg-helper", &["helper"]);
        table.add(151, Some(150), "grandchild", &["grandchild"]);
        table.add(999, Some(1), "ffmpeg", &["ffmpeg", "-i", "other.mp4"]);

        let sup = supervisor_with(&table);
        sup.register("job-a", 100, ProcessLabel::Encode);

        let report = sup.kill_job("job-a").await;

        assert_eq!(
            table.signals_for(100),
            vec![KillSignal::Term, KillSignal::Kill]
        );
        assert!(!table.is_alive(100));
        assert!(!table.is_alive(150));
        assert!(!table.is_alive(151));
        assert!(table.is_alive(999), "unrelated encoder must survive");
        assert_eq!(report.killed, 3);
        assert_eq!(report.residual, 0);
        assert!(sup.registered_pids("job-a").is_empty());
    }

    #[tokio::test]
    async fn test_fallback_finds_unregistered_processes_by_tag_and_path() {
        let table = Arc::new(FakeProcessTable::default());
        let tag_arg = format!("comment={}", ProcessSupervisor::job_tag("job-a"));
        table.add(300, Some(1), "ffmpeg", &["ffmpeg", "-metadata", tag_arg.as_str()]);
        table.add(
            301,
            Some(1),
            "ffmpeg",
            &["ffmpeg", "-i", "x", "/out/job-a/renditions/h264/720p/playlist.m3u8"],
        );
        table.add(302, Some(1), "ffprobe", &["ffprobe"]);
        table.set_cwd(302, Path::new("/tmp/hls/job-a/work"));
        table.add(303, Some(1), "bash", &["bash", "/out/job-a/script.sh"]);

        let sup = supervisor_with(&table);
        sup.set_signature(
            "job-a",
            vec![PathBuf::from("/out/job-a"), PathBuf::from("/tmp/hls/job-a")],
        );

        let report = sup.kill_job("job-a").await;

        assert!(!table.is_alive(300));
        assert!(!table.is_alive(301));
        assert!(!table.is_alive(302));
        assert!(table.is_alive(303), "non-encoder processes are left alone");
        assert_eq!(report.killed, 3);
    }

    #[tokio::test]
    async fn test_kill_job_is_idempotent() {
        let table = Arc::new(FakeProcessTable::default());
        table.add(100, Some(1), "ffmpeg", &["ffmpeg"]);
        let sup = supervisor_with(&table);
        sup.register("job-a", 100, ProcessLabel::Encode);

        let first = sup.kill_job("job-a").await;
        let second = sup.kill_job("job-a").await;

        assert_eq!(first.killed, 1);
        assert_eq!(second.killed, 0);
        assert_eq!(second.signaled, 0);
        assert_eq!(second.residual, 0);
    }

    #[tokio::test]
    async fn test_unkillable_process_is_reported_not_raised() {
        let table = Arc::new(FakeProcessTable::default());
        table.add(100, Some(1), "ffmpeg", &["ffmpeg"]);
        table.make_unkillable(100);
        let sup = supervisor_with(&table);
        sup.register("job-a", 100, ProcessLabel::Encode);

        let report = sup.kill_job("job-a").await;

        assert_eq!(report.residual, 1);
        assert_eq!(report.killed, 0);
        // still registered so a later cascade can retry it
        assert_eq!(sup.registered_pids("job-a"), vec![100]);
    }

    #[tokio::test]
    async fn test_kill_all_clears_registry() {
        let table = Arc::new(FakeProcessTable::default());
        table.add(100, Some(1), "ffmpeg", &["ffmpeg"]);
        table.add(200, Some(1), "ffmpeg", &["ffmpeg"]);
        let sup = supervisor_with(&table);
        sup.register("job-a", 100, ProcessLabel::Encode);
        sup.register("job-b", 200, ProcessLabel::Encode);

        let reports = sup.kill_all().await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.killed == 1));
        assert!(sup.records().is_empty());
        assert!(sup.is_terminated("job-a"));
    }

    #[test]
    fn test_registration_after_termination_is_refused() {
        let table = Arc::new(FakeProcessTable::default());
        table.add(100, Some(1), "ffmpeg", &["ffmpeg"]);
        let sup = supervisor_with(&table);
        sup.register("job-a", 100, ProcessLabel::Encode);

        assert_eq!(sup.begin_termination("job-a"), 1);
        assert!(!sup.register("job-a", 101, ProcessLabel::Encode));

        sup.forget_job("job-a");
        assert!(!sup.is_terminated("job-a"));
        assert!(sup.registered_pids("job-a").is_empty());
    }

    #[test]
    fn test_encoder_name_matching() {
        let table = Arc::new(FakeProcessTable::default());
        let sup = supervisor_with(&table);
        let proc_named = |name: &str, cmd0: &str| OsProcess {
            pid: 1,
            parent: None,
            name: name.to_string(),
            cmd: vec![cmd0.to_string()],
            cwd: None,
            alive: true,
        };

        assert!(sup.is_encoder(&proc_named("ffmpeg", "ffmpeg")));
        assert!(sup.is_encoder(&proc_named("FFMPEG.EXE", "C:\\bin\\ffmpeg.exe")));
        assert!(sup.is_encoder(&proc_named("ffmpeg-7", "/opt/bin/ffmpeg")));
        assert!(!sup.is_encoder(&proc_named("sleep", "sleep")));
    }

    #[test]
    fn test_invocation_builder() {
        let inv = Invocation::new("/usr/bin/ffmpeg")
            .arg("-y")
            .args(["-i", "in.mp4"]);
        assert_eq!(inv.program(), Path::new("/usr/bin/ffmpeg"));
        assert_eq!(inv.args_lossy(), vec!["-y", "-i", "in.mp4"]);

        let cmd = inv.to_command();
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args.len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_is_killed() {
        let sup = Arc::new(ProcessSupervisor::new(
            Arc::new(SysinfoProcessTable::new()),
            SupervisorSettings {
                grace: Duration::from_millis(50),
                verify_delay: Duration::from_millis(100),
                encoder_names: vec!["ffmpeg".to_string()],
            },
        ));
        let inv = Invocation::new("sleep").arg("30");
        let mut child = sup
            .spawn("job-real", ProcessLabel::Encode, &inv)
            .await
            .unwrap();
        let pid = child.pid();
        assert_eq!(sup.registered_pids("job-real"), vec![pid]);

        let report = sup.kill_job("job-real").await;
        let status = child.wait().await.unwrap();

        assert!(!status.success());
        assert!(report.signaled >= 1);
        assert_eq!(report.residual, 0);

        drop(child);
        assert!(sup.registered_pids("job-real").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_helper_orphaned_by_sigterm_is_killed() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let sup = Arc::new(ProcessSupervisor::new(
            Arc::new(SysinfoProcessTable::new()),
            SupervisorSettings {
                grace: Duration::from_millis(50),
                verify_delay: Duration::from_millis(100),
                encoder_names: vec!["ffmpeg".to_string()],
            },
        ));
        // the shell exits on SIGTERM and leaves its background sleep behind
        let inv = Invocation::new("sh")
            .arg("-c")
            .arg("sleep 313 & echo $!; wait");
        let mut child = sup
            .spawn("job-orphan", ProcessLabel::Encode, &inv)
            .await
            .unwrap();
        let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
        let helper: u32 = lines
            .next_line()
            .await
            .unwrap()
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        let report = sup.kill_job("job-orphan").await;
        let _ = child.wait().await;

        let table = SysinfoProcessTable::new();
        assert!(
            !table.snapshot().iter().any(|p| p.pid == helper && p.alive),
            "helper {} outlived the cascade",
            helper
        );
        assert!(report.signaled >= 2);
        assert_eq!(report.residual, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_refused_after_termination() {
        let sup = Arc::new(ProcessSupervisor::new(
            Arc::new(SysinfoProcessTable::new()),
            SupervisorSettings::default(),
        ));
        sup.begin_termination("job-x");

        let result = sup
            .spawn("job-x", ProcessLabel::Probe, &Invocation::new("true"))
            .await;
        assert!(matches!(result, Err(SpawnError::JobTerminated(_))));
    }
}
