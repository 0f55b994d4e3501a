//! Keeping the page cache from piling up behind the writer.
//!
//! Left alone, the kernel lets dirty pages accumulate until it has to write
//! them back in one long synchronous burst. Flushing every few seconds and
//! dropping the clean cache keeps each write-back short.

use std::{
    fs, io, thread,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::control::RunFlag;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(4);

// Granularity at which we notice the run flag going down
const POLL: Duration = Duration::from_millis(100);

pub trait CacheControl: Send {
    /// Write back every dirty page on the system
    fn sync(&mut self) -> io::Result<()>;

    /// Ask the kernel to drop reclaimable page cache
    fn drop_caches(&mut self) -> io::Result<()>;
}

/// The real thing: `sync(2)` and `/proc/sys/vm/drop_caches`
#[derive(Debug, Default)]
pub struct KernelCache;

impl CacheControl for KernelCache {
    fn sync(&mut self) -> io::Result<()> {
        // Safety: sync(2) takes no arguments and always succeeds
        #[cfg(unix)]
        unsafe {
            libc::sync();
        }
        Ok(())
    }

    fn drop_caches(&mut self) -> io::Result<()> {
        fs::write("/proc/sys/vm/drop_caches", b"1")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub passes: u64,
    pub sync_failures: u64,
    /// Whether we had to give up on dropping caches (usually not root)
    pub drop_disabled: bool,
}

pub struct Housekeeper<C> {
    control: C,
    interval: Duration,
}

impl<C: CacheControl> Housekeeper<C> {
    pub fn new(control: C, interval: Duration) -> Self {
        Self { control, interval }
    }

    fn pass(&mut self, report: &mut HousekeepingReport) {
        if let Err(e) = self.control.sync() {
            report.sync_failures += 1;
            warn!("sync failed: {e}");
        }
        if !report.drop_disabled {
            if let Err(e) = self.control.drop_caches() {
                // Not going to start working later, don't warn every pass
                warn!("can't drop page cache ({e}), only syncing from now on");
                report.drop_disabled = true;
            }
        }
        report.passes += 1;
    }

    /// Sync and trim every interval until `running` is cleared
    pub fn run(mut self, running: &RunFlag) -> HousekeepingReport {
        info!("cache housekeeper starting, every {:?}", self.interval);
        let mut report = HousekeepingReport::default();
        while running.is_set() {
            self.pass(&mut report);
            let next = Instant::now() + self.interval;
            while running.is_set() {
                let now = Instant::now();
                if now >= next {
                    break;
                }
                thread::sleep(POLL.min(next - now));
            }
        }
        info!("cache housekeeper exiting after {} passes", report.passes);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    #[derive(Clone, Default)]
    struct Counting {
        syncs: Arc<AtomicU64>,
        drops: Arc<AtomicU64>,
        deny_drop: bool,
    }

    impl CacheControl for Counting {
        fn sync(&mut self) -> io::Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn drop_caches(&mut self) -> io::Result<()> {
            if self.deny_drop {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.drops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_runs_until_cleared() {
        let control = Counting::default();
        let running = RunFlag::running();
        let flag = running.clone();
        let hk = Housekeeper::new(control.clone(), Duration::from_millis(10));
        let handle = thread::spawn(move || hk.run(&flag));
        thread::sleep(Duration::from_millis(60));
        running.clear();
        let report = handle.join().unwrap();
        assert!(report.passes >= 1);
        assert_eq!(control.syncs.load(Ordering::SeqCst), report.passes);
        assert_eq!(control.drops.load(Ordering::SeqCst), report.passes);
        assert!(!report.drop_disabled);
    }

    #[test]
    fn test_denied_drop_keeps_syncing() {
        let control = Counting {
            deny_drop: true,
            ..Default::default()
        };
        let mut hk = Housekeeper::new(control.clone(), Duration::from_secs(1));
        let mut report = HousekeepingReport::default();
        hk.pass(&mut report);
        hk.pass(&mut report);
        assert!(report.drop_disabled);
        assert_eq!(report.passes, 2);
        assert_eq!(control.syncs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cleared_flag_exits_promptly() {
        let running = RunFlag::running();
        running.clear();
        let report = Housekeeper::new(Counting::default(), Duration::from_secs(3600)).run(&running);
        assert_eq!(report.passes, 0);
    }
}
