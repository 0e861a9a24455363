//! Frequency and idle control
//!
//! Per core, the controller turns burst statistics into two kinds of advice:
//!
//! - **Idle hints** when every port keeps coming back empty. The hint grows
//!   with the run of empty bursts and picks between spinning, sleeping and
//!   blocking on receive readiness.
//! - **Frequency hints** when ports are busy. Pending descriptors deep in the
//!   ring push a trend counter; deep enough backlogs jump straight to the
//!   highest frequency.
//!
//! A periodic timer scales the core back down when it slept a lot or when
//! bursts stayed small.

use crate::io::BurstIo;
use crate::stats::CoreStats;
use parking_lot::Mutex;
use sensor_common::{PortId, PowerConfig, QueueId};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frequency advice, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FreqHint {
    #[default]
    Current,
    Higher,
    Highest,
}

/// What an idle core should do with its hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Busy-wait, cheaper than a context switch
    Spin(Duration),
    /// Timed sleep
    Sleep(Duration),
    /// Block until a port has frames
    Block,
}

/// Per-core frequency hooks
///
/// Every call is advisory; failures are logged by the caller and otherwise
/// ignored.
pub trait FrequencyScaler: Send + Sync {
    fn freq_down(&self, core: usize) -> io::Result<()>;
    fn freq_up(&self, core: usize) -> io::Result<()>;
    fn freq_max(&self, core: usize) -> io::Result<()>;
    /// Hand the core back to its original governor
    fn exit(&self, core: usize) -> io::Result<()>;
}

/// Scaler that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScaler;

impl FrequencyScaler for NoopScaler {
    fn freq_down(&self, _core: usize) -> io::Result<()> {
        Ok(())
    }

    fn freq_up(&self, _core: usize) -> io::Result<()> {
        Ok(())
    }

    fn freq_max(&self, _core: usize) -> io::Result<()> {
        Ok(())
    }

    fn exit(&self, _core: usize) -> io::Result<()> {
        Ok(())
    }
}

struct CpuFreq {
    dir: PathBuf,
    governor: String,
    /// Available frequencies in kHz, highest first
    steps: Vec<u64>,
    current: usize,
}

/// cpufreq through sysfs with the `userspace` governor
pub struct SysfsScaler {
    cores: Vec<Mutex<CpuFreq>>,
}

impl SysfsScaler {
    /// Take over `cores` CPUs starting at 0
    pub fn init(cores: usize) -> io::Result<Self> {
        Self::init_at("/sys/devices/system/cpu", cores)
    }

    fn init_at(root: impl Into<PathBuf>, cores: usize) -> io::Result<Self> {
        let root = root.into();
        let mut out = Vec::with_capacity(cores);

        for core in 0..cores {
            let dir = root.join(format!("cpu{}", core)).join("cpufreq");
            let governor = std::fs::read_to_string(dir.join("scaling_governor"))?.trim().to_string();
            let mut steps: Vec<u64> = std::fs::read_to_string(dir.join("scaling_available_frequencies"))?
                .split_whitespace()
                .filter_map(|s| s.parse().ok())
                .collect();
            if steps.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("cpu{}: no available frequencies", core),
                ));
            }
            steps.sort_unstable_by(|a, b| b.cmp(a));
            steps.dedup();

            std::fs::write(dir.join("scaling_governor"), "userspace")?;
            std::fs::write(dir.join("scaling_setspeed"), steps[0].to_string())?;
            tracing::info!(core, governor = %governor, steps = steps.len(), "cpufreq scaling enabled");

            out.push(Mutex::new(CpuFreq {
                dir,
                governor,
                steps,
                current: 0,
            }));
        }

        Ok(Self { cores: out })
    }

    fn step(&self, core: usize, f: impl FnOnce(usize, usize) -> usize) -> io::Result<()> {
        let Some(cpu) = self.cores.get(core) else {
            return Ok(());
        };
        let mut cpu = cpu.lock();
        let next = f(cpu.current, cpu.steps.len() - 1);
        if next == cpu.current {
            return Ok(());
        }
        std::fs::write(cpu.dir.join("scaling_setspeed"), cpu.steps[next].to_string())?;
        cpu.current = next;
        Ok(())
    }
}

impl FrequencyScaler for SysfsScaler {
    fn freq_down(&self, core: usize) -> io::Result<()> {
        self.step(core, |cur, lowest| (cur + 1).min(lowest))
    }

    fn freq_up(&self, core: usize) -> io::Result<()> {
        self.step(core, |cur, _| cur.saturating_sub(1))
    }

    fn freq_max(&self, core: usize) -> io::Result<()> {
        self.step(core, |_, _| 0)
    }

    fn exit(&self, core: usize) -> io::Result<()> {
        let Some(cpu) = self.cores.get(core) else {
            return Ok(());
        };
        let cpu = cpu.lock();
        std::fs::write(cpu.dir.join("scaling_governor"), &cpu.governor)
    }
}

/// Idle hint for a run of `zero_rx` empty bursts, in microseconds
///
/// Nothing up to `zero_rx_min`; past that the hint steps up by
/// `sleep_base_usecs` every `zero_rx_min` bursts until `max_idle_usecs`.
pub fn idle_hint(config: &PowerConfig, zero_rx: u64) -> Option<u32> {
    let min = config.zero_rx_min.max(1);
    if zero_rx <= min {
        return None;
    }
    let steps = zero_rx / min;
    let hint = steps
        .saturating_mul(config.sleep_base_usecs as u64)
        .min(config.max_idle_usecs as u64);
    Some(hint as u32)
}

/// Per-core controller
pub struct PowerController {
    core: usize,
    config: PowerConfig,
    burst_size: u64,
    scaler: Arc<dyn FrequencyScaler>,
    stats: CoreStats,
    interval: Duration,
    next_timer: Instant,
}

impl PowerController {
    pub fn new(
        core: usize,
        config: PowerConfig,
        burst_size: usize,
        scaler: Arc<dyn FrequencyScaler>,
        now: Instant,
    ) -> Self {
        let interval = Duration::from_millis(config.timer_interval_ms.max(1));
        Self {
            core,
            config,
            burst_size: burst_size as u64,
            scaler,
            stats: CoreStats::default(),
            interval,
            next_timer: now + interval,
        }
    }

    pub fn stats(&self) -> &CoreStats {
        &self.stats
    }

    #[inline(always)]
    pub fn record_iteration(&mut self) {
        self.stats.loop_iterations += 1;
    }

    #[inline(always)]
    pub fn record_rx(&mut self, packets: u64) {
        self.stats.rx_processed += packets;
    }

    #[inline(always)]
    pub fn record_sleep(&mut self, usecs: u64) {
        self.stats.sleep_usecs += usecs;
    }

    pub fn idle_hint(&self, zero_rx: u64) -> Option<u32> {
        idle_hint(&self.config, zero_rx)
    }

    /// Turn an idle hint into an action; blocking needs working interrupts
    pub fn idle_action(&self, hint: u32, can_block: bool) -> IdleAction {
        let wait = Duration::from_micros(hint as u64);
        if hint < self.config.busy_wait_max_usecs {
            IdleAction::Spin(wait)
        } else if hint < self.config.suspend_usecs || !can_block {
            IdleAction::Sleep(wait)
        } else {
            IdleAction::Block
        }
    }

    /// Probe a busy port's ring depth and update the trend
    pub fn check_scale_up(&mut self, io: &dyn BurstIo, port: PortId, queue: QueueId) -> FreqHint {
        let c = &self.config;
        if io.rx_descriptor_done(port, queue, c.batch_3) {
            self.stats.freq_trend = 0;
            return FreqHint::Highest;
        } else if io.rx_descriptor_done(port, queue, c.batch_2) {
            self.stats.freq_trend = self.stats.freq_trend.saturating_add(c.trend_batch_2);
        } else if io.rx_descriptor_done(port, queue, c.batch_1) {
            self.stats.freq_trend = self.stats.freq_trend.saturating_add(c.trend_batch_1);
        }

        if self.stats.freq_trend > c.trend_freq_up {
            self.stats.freq_trend = 0;
            return FreqHint::Higher;
        }
        FreqHint::Current
    }

    /// Act on the strongest hint across the busy ports
    pub fn apply(&self, hint: FreqHint) {
        let result = match hint {
            FreqHint::Current => return,
            FreqHint::Higher => self.scaler.freq_up(self.core),
            FreqHint::Highest => self.scaler.freq_max(self.core),
        };
        if let Err(e) = result {
            tracing::debug!(core = self.core, ?hint, error = %e, "frequency change failed");
        }
    }

    /// Run the scale-down timer if due; true when it fired
    pub fn poll_timer(&mut self, now: Instant) -> bool {
        if now < self.next_timer {
            return false;
        }

        let period_usecs = self.interval.as_micros() as f64;
        let sleep_ratio = self.stats.sleep_usecs as f64 / period_usecs;
        let small_bursts = self.stats.rx_per_iteration() < self.burst_size;

        if sleep_ratio >= self.config.sleep_ratio_threshold || small_bursts {
            if let Err(e) = self.scaler.freq_down(self.core) {
                tracing::debug!(core = self.core, error = %e, "frequency decrease failed");
            }
        }

        // re-arm from now so the cadence does not drift with frequency
        self.next_timer = now + self.interval;
        self.stats.reset_window();
        true
    }
}
