//! Per-core worker loop
//!
//! Each iteration walks four phases:
//!
//! ```text
//!   TX-DRAIN ──▶ RX-POLL ──▶ CLASSIFY ──▶ IDLE-DECISION
//!      ▲            ▲                          │
//!      │            └──── after a block ───────┤
//!      └───────────────────────────────────────┘
//! ```
//!
//! Nothing inside the loop is fatal. Transmit shortfalls and full transports
//! are counted and forgotten; the only place the thread suspends is the
//! receive-ready wait.

use crate::context::SensorContext;
use crate::io::{BurstIo, Packet};
use crate::power::{FreqHint, IdleAction, PowerController};
use crate::protocol::{default_handlers, ProtocolHandler};
use crate::telemetry::Telemetry;
use crate::tx::TxBuffer;
use sensor_common::{Direction, FrameView, MetadataExtractor, PortId, QueueId};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Loop phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    TxDrain,
    RxPoll,
    Classify,
    IdleDecision,
}

#[derive(Debug, Default, Clone, Copy)]
struct PortQueueState {
    zero_rx: u64,
    idle_hint: Option<u32>,
    freq_hint: FreqHint,
    active: bool,
}

/// One worker core
pub struct Worker {
    core: usize,
    queue: QueueId,
    ctx: Arc<SensorContext>,
    power: PowerController,
    tx: Vec<TxBuffer>,
    ports: Vec<PortQueueState>,
    handlers: Vec<Box<dyn ProtocolHandler>>,
    telemetry: Option<Telemetry>,
    burst: Vec<Packet>,
    replies: Vec<Packet>,
    burst_size: usize,
    drain_interval: Duration,
    last_drain: Instant,
    can_block: bool,
}

impl Worker {
    /// Core 0 reports telemetry
    pub fn new(core: usize, ctx: Arc<SensorContext>) -> Self {
        let config = ctx.config();
        let now = Instant::now();
        let queue = core as QueueId;
        let port_count = ctx.port_count();
        let burst_size = config.scheduler.burst_size;

        let can_block = config.power.interrupts && register_interrupts(ctx.io().as_ref(), port_count, queue, core);
        let telemetry = (core == 0 && config.stats_interval_secs > 0)
            .then(|| Telemetry::new(Duration::from_secs(config.stats_interval_secs), now));

        Self {
            core,
            queue,
            power: PowerController::new(core, config.power.clone(), burst_size, ctx.scaler().clone(), now),
            tx: (0..port_count).map(|p| TxBuffer::new(p as PortId, burst_size)).collect(),
            ports: vec![PortQueueState::default(); port_count],
            handlers: default_handlers(ctx.identities()),
            telemetry,
            burst: Vec::with_capacity(burst_size * port_count.max(1)),
            replies: Vec::new(),
            burst_size,
            drain_interval: Duration::from_micros(config.scheduler.tx_drain_usecs),
            last_drain: now,
            can_block,
            ctx,
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    /// Whether the idle path may block on receive readiness
    pub fn can_block(&self) -> bool {
        self.can_block
    }

    pub fn power(&self) -> &PowerController {
        &self.power
    }

    /// Run until the context stops
    pub fn run(mut self) {
        tracing::info!(core = self.core, can_block = self.can_block, "entering main loop");

        let mut phase = Phase::TxDrain;
        while self.ctx.is_running() {
            phase = self.step(phase);
        }

        self.flush_all();
        tracing::info!(core = self.core, "left main loop");
    }

    /// One full iteration, back to TX-DRAIN
    pub fn run_once(&mut self) {
        let mut phase = self.step(Phase::TxDrain);
        while phase != Phase::TxDrain && self.ctx.is_running() {
            phase = self.step(phase);
        }
    }

    /// Execute one phase and return the next
    pub fn step(&mut self, phase: Phase) -> Phase {
        match phase {
            Phase::TxDrain => {
                self.tx_drain(Instant::now());
                Phase::RxPoll
            }
            Phase::RxPoll => {
                self.rx_poll();
                Phase::Classify
            }
            Phase::Classify => {
                self.classify();
                Phase::IdleDecision
            }
            Phase::IdleDecision => self.idle_decision(),
        }
    }

    fn tx_drain(&mut self, now: Instant) {
        self.power.record_iteration();

        if now.saturating_duration_since(self.last_drain) > self.drain_interval {
            self.flush_all();
            for handler in &mut self.handlers {
                handler.on_timer(now);
            }
            if let Some(telemetry) = self.telemetry.as_mut() {
                telemetry.poll(&self.ctx, now);
            }
            self.last_drain = now;
        }

        self.power.poll_timer(now);
    }

    fn rx_poll(&mut self) {
        self.burst.clear();
        let io = self.ctx.io().clone();

        for (port, state) in self.ports.iter_mut().enumerate() {
            let port = port as PortId;
            let count = io.receive_burst(port, self.queue, &mut self.burst, self.burst_size);
            state.active = count > 0;

            if count == 0 {
                state.zero_rx = state.zero_rx.saturating_add(1);
                state.idle_hint = self.power.idle_hint(state.zero_rx);
                continue;
            }

            state.zero_rx = 0;
            state.idle_hint = None;
            // probing ring depth costs a syscall on some ports; only busy ones
            state.freq_hint = self.power.check_scale_up(io.as_ref(), port, self.queue);
            self.power.record_rx(count as u64);
            self.ctx.port_stats().record_rx(port, count as u64);
        }
    }

    fn classify(&mut self) {
        let ctx = &self.ctx;
        let extractor = ctx.extractor();
        let classifier = ctx.classifier();

        for packet in &self.burst {
            let Some(frame) = FrameView::parse(&packet.data) else {
                tracing::trace!(port = packet.port, len = packet.len(), "runt frame");
                continue;
            };
            let metadata = extractor.extract(packet.port, Direction::Rx, &frame);

            for handler in &mut self.handlers {
                handler.handle(packet.port, &frame, &metadata, &mut self.replies);
            }
            classifier.classify(&frame, &metadata);
        }
        self.burst.clear();

        let io = ctx.io().as_ref();
        for reply in self.replies.drain(..) {
            if let Some(buf) = self.tx.get_mut(reply.port as usize) {
                buf.enqueue(reply, io, self.queue, ctx.port_stats());
            }
        }
    }

    fn idle_decision(&mut self) -> Phase {
        let all_idle = !self.ports.is_empty() && self.ports.iter().all(|p| p.idle_hint.is_some());

        if !all_idle {
            let hint = self
                .ports
                .iter()
                .filter(|p| p.active)
                .map(|p| p.freq_hint)
                .max()
                .unwrap_or_default();
            self.power.apply(hint);
            return Phase::TxDrain;
        }

        // every port idle: the longest hint wins
        let hint = self.ports.iter().filter_map(|p| p.idle_hint).max().unwrap_or(0);
        match self.power.idle_action(hint, self.can_block) {
            IdleAction::Spin(wait) => {
                let until = Instant::now() + wait;
                while Instant::now() < until {
                    std::hint::spin_loop();
                }
                self.power.record_sleep(wait.as_micros() as u64);
                Phase::TxDrain
            }
            IdleAction::Sleep(wait) => {
                let start = Instant::now();
                std::thread::sleep(wait);
                self.power.record_sleep(start.elapsed().as_micros() as u64);
                Phase::TxDrain
            }
            IdleAction::Block => {
                self.block();
                Phase::RxPoll
            }
        }
    }

    fn block(&mut self) {
        // pending replies must not sit out the wait
        self.flush_all();

        let io = self.ctx.io().clone();
        for port in 0..self.ports.len() {
            if let Err(e) = io.rx_interrupt_enable(port as PortId, self.queue) {
                tracing::warn!(core = self.core, port, error = %e, "rx interrupt enable failed, blocking disabled");
                self.can_block = false;
                return;
            }
        }
        if !self.ctx.is_running() {
            return;
        }

        tracing::debug!(core = self.core, "sleeping until rx ready");
        let start = Instant::now();
        if let Err(e) = io.rx_interrupt_wait(self.queue, None) {
            tracing::warn!(core = self.core, error = %e, "rx wait failed, blocking disabled");
            self.can_block = false;
        }
        self.power.record_sleep(start.elapsed().as_micros() as u64);
        tracing::debug!(core = self.core, "woke from rx wait");
    }

    fn flush_all(&mut self) {
        let io = self.ctx.io().as_ref();
        let stats = self.ctx.port_stats();
        for buf in &mut self.tx {
            buf.flush(io, self.queue, stats);
        }
    }
}

/// Register every port's queue for this core; any failure disables blocking
fn register_interrupts(io: &dyn BurstIo, ports: usize, queue: QueueId, core: usize) -> bool {
    for port in 0..ports {
        if let Err(e) = io.rx_interrupt_register(port as PortId, queue) {
            tracing::warn!(core, port, error = %e, "rx interrupt could not be registered");
            return false;
        }
    }
    tracing::info!(core, "rx interrupts registered");
    true
}
