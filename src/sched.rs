//! Scheduling class, priority and CPU pinning for the pipeline threads.
//!
//! The capture thread runs round-robin real-time at the highest priority the
//! system allows, the writer round-robin below it, and the cache housekeeper
//! stays in the normal time-shared class. Each gets its own core.
//!
//! Not being allowed to do any of this is never fatal: we warn and carry on
//! under whatever the thread already had.

use std::{fmt, io, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// The default time-shared class
    Other,
    Batch,
    Idle,
    Fifo,
    RoundRobin,
    Unknown(i32),
}

impl Policy {
    pub fn is_realtime(self) -> bool {
        matches!(self, Policy::Fifo | Policy::RoundRobin)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Other => write!(f, "SCHED_OTHER"),
            Policy::Batch => write!(f, "SCHED_BATCH"),
            Policy::Idle => write!(f, "SCHED_IDLE"),
            Policy::Fifo => write!(f, "SCHED_FIFO"),
            Policy::RoundRobin => write!(f, "SCHED_RR"),
            Policy::Unknown(raw) => write!(f, "policy {raw}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtPolicy {
    Fifo,
    RoundRobin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtPriority {
    /// Whatever the platform's maximum for the policy is
    Max,
    Fixed(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedClass {
    Normal { nice: i32 },
    RealTime { policy: RtPolicy, priority: RtPriority },
}

/// What a worker asks for before its main loop starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulingRequest {
    pub class: SchedClass,
    pub affinity: Option<Vec<usize>>,
}

impl SchedulingRequest {
    pub fn capture(core: Option<usize>) -> Self {
        Self {
            class: SchedClass::RealTime {
                policy: RtPolicy::RoundRobin,
                priority: RtPriority::Max,
            },
            affinity: core.map(|c| vec![c]),
        }
    }

    pub fn writer(priority: i32, core: Option<usize>) -> Self {
        Self {
            class: SchedClass::RealTime {
                policy: RtPolicy::RoundRobin,
                priority: RtPriority::Fixed(priority),
            },
            affinity: core.map(|c| vec![c]),
        }
    }

    pub fn housekeeper(core: Option<usize>) -> Self {
        Self {
            class: SchedClass::Normal { nice: 0 },
            affinity: core.map(|c| vec![c]),
        }
    }

    /// Leave the class alone, only pin
    pub fn unprivileged(mut self) -> Self {
        self.class = SchedClass::Normal { nice: 0 };
        self
    }
}

/// What the thread actually ended up with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveScheduling {
    pub policy: Policy,
    /// Real-time priority for real-time policies, nice value otherwise
    pub priority: i32,
    pub affinity: Vec<usize>,
}

impl EffectiveScheduling {
    /// The class to go back to this state
    pub fn as_class(&self) -> SchedClass {
        match self.policy {
            Policy::Fifo => SchedClass::RealTime {
                policy: RtPolicy::Fifo,
                priority: RtPriority::Fixed(self.priority),
            },
            Policy::RoundRobin => SchedClass::RealTime {
                policy: RtPolicy::RoundRobin,
                priority: RtPriority::Fixed(self.priority),
            },
            _ => SchedClass::Normal {
                nice: self.priority,
            },
        }
    }
}

impl fmt::Display for EffectiveScheduling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = if self.policy.is_realtime() {
            "priority"
        } else {
            "nice"
        };
        write!(f, "{} {} {}, cpus {:?}", self.policy, what, self.priority, self.affinity)
    }
}

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("not permitted: {0}")]
    PermissionDenied(&'static str),
    #[error("cpu set {0:?} is not usable")]
    InvalidAffinity(Vec<usize>),
    #[error("{what}: {source}")]
    Os {
        what: &'static str,
        source: io::Error,
    },
    #[error("not supported on this platform")]
    Unsupported,
}

/// The OS-specific half of scheduling. Every call applies to the calling
/// thread only.
pub trait PlatformScheduler: Send + Sync {
    fn set_class(&self, class: &SchedClass) -> Result<(), SchedError>;

    fn set_affinity(&self, cpus: &[usize]) -> Result<(), SchedError>;

    fn current(&self) -> EffectiveScheduling;
}

/// Apply `request` to the calling thread and log what we got.
///
/// Failures are reported and returned alongside the effective state, the
/// thread keeps running either way.
pub fn configure_current_thread(
    scheduler: &dyn PlatformScheduler,
    role: &str,
    request: &SchedulingRequest,
) -> (EffectiveScheduling, Vec<SchedError>) {
    let mut errors = Vec::new();
    if let Some(cpus) = &request.affinity {
        if let Err(e) = scheduler.set_affinity(cpus) {
            warn!("{role}: couldn't pin to cpus {cpus:?} ({e}), running unpinned");
            errors.push(e);
        }
    }
    if let Err(e) = scheduler.set_class(&request.class) {
        warn!(
            "{role}: couldn't switch to {:?} ({e}), running degraded on the default scheduler",
            request.class
        );
        errors.push(e);
    }
    let effective = scheduler.current();
    info!("{role}: scheduler, priority, affinity: {effective}");
    (effective, errors)
}

/// Scheduling that reverts to whatever the thread had before when dropped
pub struct ScopedScheduling {
    scheduler: Arc<dyn PlatformScheduler>,
    previous: EffectiveScheduling,
    effective: EffectiveScheduling,
    errors: Vec<SchedError>,
}

impl ScopedScheduling {
    pub fn apply(
        scheduler: Arc<dyn PlatformScheduler>,
        role: &str,
        request: &SchedulingRequest,
    ) -> Self {
        let previous = scheduler.current();
        let (effective, errors) = configure_current_thread(scheduler.as_ref(), role, request);
        Self {
            scheduler,
            previous,
            effective,
            errors,
        }
    }

    pub fn effective(&self) -> &EffectiveScheduling {
        &self.effective
    }

    /// Whether everything asked for was granted
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl Drop for ScopedScheduling {
    fn drop(&mut self) {
        if self.previous.policy == self.effective.policy
            && self.previous.priority == self.effective.priority
        {
            return;
        }
        if let Err(e) = self.scheduler.set_class(&self.previous.as_class()) {
            debug!("couldn't restore scheduling to {}: {e}", self.previous);
        }
    }
}

/// Try the real-time class at its top priority and put things back.
pub fn probe_realtime(scheduler: &dyn PlatformScheduler) -> bool {
    let before = scheduler.current();
    let rt = SchedClass::RealTime {
        policy: RtPolicy::RoundRobin,
        priority: RtPriority::Max,
    };
    match scheduler.set_class(&rt) {
        Ok(()) => {
            if let Err(e) = scheduler.set_class(&before.as_class()) {
                warn!("couldn't restore scheduling after probe: {e}");
            }
            true
        }
        Err(e) => {
            warn!("real-time scheduling unavailable ({e}), the capture will run degraded");
            false
        }
    }
}

/// Does nothing and says so. Used where the platform has no real-time classes.
#[derive(Debug, Default)]
pub struct BestEffortScheduler;

impl PlatformScheduler for BestEffortScheduler {
    fn set_class(&self, class: &SchedClass) -> Result<(), SchedError> {
        match class {
            SchedClass::Normal { nice: 0 } => Ok(()),
            _ => Err(SchedError::Unsupported),
        }
    }

    fn set_affinity(&self, _cpus: &[usize]) -> Result<(), SchedError> {
        Err(SchedError::Unsupported)
    }

    fn current(&self) -> EffectiveScheduling {
        EffectiveScheduling {
            policy: Policy::Other,
            priority: 0,
            affinity: Vec::new(),
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxScheduler;

/// The best scheduler this platform has
pub fn platform_scheduler() -> Arc<dyn PlatformScheduler> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxScheduler)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(BestEffortScheduler)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::{io, mem};

    use super::*;

    /// `sched_setscheduler`, `setpriority` and `sched_setaffinity` with a pid
    /// of 0 all act on the calling thread on Linux.
    #[derive(Debug, Default)]
    pub struct LinuxScheduler;

    fn param(priority: i32) -> libc::sched_param {
        // Safety: sched_param is plain old data
        let mut p: libc::sched_param = unsafe { mem::zeroed() };
        p.sched_priority = priority;
        p
    }

    fn os_error(what: &'static str) -> SchedError {
        let source = io::Error::last_os_error();
        match source.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => SchedError::PermissionDenied(what),
            _ => SchedError::Os { what, source },
        }
    }

    fn policy_of(raw: i32) -> Policy {
        match raw {
            libc::SCHED_OTHER => Policy::Other,
            libc::SCHED_BATCH => Policy::Batch,
            libc::SCHED_IDLE => Policy::Idle,
            libc::SCHED_FIFO => Policy::Fifo,
            libc::SCHED_RR => Policy::RoundRobin,
            other => Policy::Unknown(other),
        }
    }

    impl PlatformScheduler for LinuxScheduler {
        fn set_class(&self, class: &SchedClass) -> Result<(), SchedError> {
            match *class {
                SchedClass::Normal { nice } => {
                    // Safety: plain syscalls on the calling thread
                    if unsafe { libc::sched_setscheduler(0, libc::SCHED_OTHER, &param(0)) } != 0 {
                        return Err(os_error("sched_setscheduler(SCHED_OTHER)"));
                    }
                    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
                        return Err(os_error("setpriority"));
                    }
                }
                SchedClass::RealTime { policy, priority } => {
                    let raw = match policy {
                        RtPolicy::Fifo => libc::SCHED_FIFO,
                        RtPolicy::RoundRobin => libc::SCHED_RR,
                    };
                    let priority = match priority {
                        RtPriority::Max => unsafe { libc::sched_get_priority_max(raw) },
                        RtPriority::Fixed(p) => p,
                    };
                    if unsafe { libc::sched_setscheduler(0, raw, &param(priority)) } != 0 {
                        return Err(os_error("sched_setscheduler"));
                    }
                }
            }
            Ok(())
        }

        fn set_affinity(&self, cpus: &[usize]) -> Result<(), SchedError> {
            // Safety: cpu_set_t is a plain bitmask
            let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
            for &cpu in cpus {
                if cpu >= libc::CPU_SETSIZE as usize {
                    return Err(SchedError::InvalidAffinity(cpus.to_vec()));
                }
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
            if unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) } != 0 {
                return match io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINVAL) => Err(SchedError::InvalidAffinity(cpus.to_vec())),
                    _ => Err(os_error("sched_setaffinity")),
                };
            }
            Ok(())
        }

        fn current(&self) -> EffectiveScheduling {
            let policy = policy_of(unsafe { libc::sched_getscheduler(0) });
            let priority = if policy.is_realtime() {
                let mut p = param(0);
                unsafe { libc::sched_getparam(0, &mut p) };
                p.sched_priority
            } else {
                unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) }
            };
            let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
            let mut affinity = Vec::new();
            if unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) } == 0
            {
                for cpu in 0..libc::CPU_SETSIZE as usize {
                    if unsafe { libc::CPU_ISSET(cpu, &set) } {
                        affinity.push(cpu);
                    }
                }
            }
            EffectiveScheduling {
                policy,
                priority,
                affinity,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Grants normal classes, refuses real-time, remembers everything
    #[derive(Default)]
    struct Unprivileged {
        state: Mutex<Option<EffectiveScheduling>>,
    }

    impl PlatformScheduler for Unprivileged {
        fn set_class(&self, class: &SchedClass) -> Result<(), SchedError> {
            match *class {
                SchedClass::Normal { nice } => {
                    let mut state = self.state.lock().unwrap();
                    let affinity = state.take().map(|s| s.affinity).unwrap_or_default();
                    *state = Some(EffectiveScheduling {
                        policy: Policy::Other,
                        priority: nice,
                        affinity,
                    });
                    Ok(())
                }
                SchedClass::RealTime { .. } => Err(SchedError::PermissionDenied("sched_setscheduler")),
            }
        }

        fn set_affinity(&self, cpus: &[usize]) -> Result<(), SchedError> {
            if cpus.iter().any(|&c| c > 3) {
                return Err(SchedError::InvalidAffinity(cpus.to_vec()));
            }
            let mut state = self.state.lock().unwrap();
            let mut now = state.take().unwrap_or_else(|| BestEffortScheduler.current());
            now.affinity = cpus.to_vec();
            *state = Some(now);
            Ok(())
        }

        fn current(&self) -> EffectiveScheduling {
            self.state
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| BestEffortScheduler.current())
        }
    }

    #[test]
    fn test_worker_classes() {
        assert!(matches!(
            SchedulingRequest::capture(Some(5)).class,
            SchedClass::RealTime {
                policy: RtPolicy::RoundRobin,
                priority: RtPriority::Max
            }
        ));
        let writer = SchedulingRequest::writer(10, Some(4));
        assert_eq!(writer.affinity, Some(vec![4]));
        assert_eq!(
            SchedulingRequest::housekeeper(None),
            SchedulingRequest {
                class: SchedClass::Normal { nice: 0 },
                affinity: None
            }
        );
        assert_eq!(
            writer.unprivileged().class,
            SchedClass::Normal { nice: 0 }
        );
    }

    #[test]
    fn test_denied_realtime_is_not_fatal() {
        let sched = Unprivileged::default();
        let (effective, errors) =
            configure_current_thread(&sched, "capture", &SchedulingRequest::capture(Some(2)));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SchedError::PermissionDenied(_)));
        assert_eq!(effective.policy, Policy::Other);
        assert_eq!(effective.affinity, vec![2]);
        assert!(!probe_realtime(&sched));
    }

    #[test]
    fn test_bad_core_reported() {
        let sched = Unprivileged::default();
        let (_, errors) =
            configure_current_thread(&sched, "writer", &SchedulingRequest::housekeeper(Some(9)));
        assert!(matches!(errors.as_slice(), [SchedError::InvalidAffinity(_)]));
    }

    #[test]
    fn test_scoped_scheduling_restores() {
        let sched: Arc<Unprivileged> = Arc::new(Unprivileged::default());
        let request = SchedulingRequest {
            class: SchedClass::Normal { nice: 5 },
            affinity: None,
        };
        {
            let scoped = ScopedScheduling::apply(sched.clone(), "test", &request);
            assert!(!scoped.is_degraded());
            assert_eq!(scoped.effective().priority, 5);
            assert_eq!(sched.current().priority, 5);
        }
        assert_eq!(sched.current().priority, 0);
    }

    #[test]
    fn test_best_effort() {
        let sched = BestEffortScheduler;
        assert!(sched.set_class(&SchedClass::Normal { nice: 0 }).is_ok());
        assert!(sched.set_affinity(&[0]).is_err());
        assert_eq!(sched.current().to_string(), "SCHED_OTHER nice 0, cpus []");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_reads_current_thread() {
        let effective = LinuxScheduler.current();
        assert!(!effective.affinity.is_empty());
    }
}
