//! Sensor engine
//!
//! Starts one worker thread per configured core and tears them down in the
//! order the hardware needs: stop flag, wake blocked workers, join, close
//! ports, hand the cores back to their frequency governor.

use crate::context::SensorContext;
use crate::scheduler::Worker;
use crate::EngineError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Per-worker handle
struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    core: usize,
}

/// Running sensor
pub struct Engine {
    ctx: Arc<SensorContext>,
    workers: Vec<WorkerHandle>,
    stopped: bool,
}

impl Engine {
    pub fn new(ctx: Arc<SensorContext>) -> Self {
        Self {
            ctx,
            workers: Vec::new(),
            stopped: false,
        }
    }

    pub fn context(&self) -> &Arc<SensorContext> {
        &self.ctx
    }

    /// Spawn the workers
    pub fn start(&mut self) -> Result<(), EngineError> {
        if !self.workers.is_empty() {
            return Err(EngineError::AlreadyRunning);
        }

        let cores = self.ctx.config().cores;
        for core in 0..cores {
            let worker = Worker::new(core, self.ctx.clone());
            let handle = thread::Builder::new()
                .name(format!("sensor-worker-{}", core))
                .spawn(move || worker.run())
                .map_err(|e| EngineError::SpawnFailed(e.to_string()));

            match handle {
                Ok(handle) => self.workers.push(WorkerHandle {
                    thread: Some(handle),
                    core,
                }),
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        }

        tracing::info!(cores, ports = self.ctx.port_count(), "sensor engine started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty() && self.ctx.is_running()
    }

    /// Stop workers, close ports, release frequency control. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.ctx.request_stop();
        let io = self.ctx.io().clone();

        for worker in &mut self.workers {
            let Some(handle) = worker.thread.take() else {
                continue;
            };
            // a worker may start blocking just after the first wake
            while !handle.is_finished() {
                io.wake();
                thread::sleep(Duration::from_millis(1));
            }
            if handle.join().is_err() {
                tracing::error!(core = worker.core, "worker panicked");
            }
        }

        io.close();
        tracing::info!(ports = self.ctx.port_count(), "ports closed");

        let scaler = self.ctx.scaler();
        for core in 0..self.ctx.config().cores {
            if let Err(e) = scaler.exit(core) {
                tracing::warn!(core, error = %e, "could not release frequency control");
            }
        }

        self.workers.clear();
        tracing::info!("sensor engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BurstIo, RingPorts};
    use sensor_common::SensorConfig;

    fn engine(cores: usize, io: Arc<RingPorts>) -> Engine {
        let config = SensorConfig::from_json(&format!(
            r#"{{"cores": {}, "ports": [{{"interface": "ring0"}}], "power": {{"zero_rx_min": 1, "sleep_base_usecs": 500}}}}"#,
            cores
        ))
        .unwrap();
        Engine::new(Arc::new(SensorContext::new(config, io).unwrap()))
    }

    #[test]
    fn test_engine_lifecycle() {
        let io = Arc::new(RingPorts::new(1, 2, 16));
        let mut engine = engine(2, io.clone());

        assert!(!engine.is_running());
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));

        // long enough for both workers to reach the blocking wait
        thread::sleep(Duration::from_millis(50));

        engine.stop();
        assert!(!engine.is_running());
        let mut out = Vec::new();
        assert!(!io.inject(0, 0, vec![0u8; 60]));
        assert_eq!(io.receive_burst(0, 0, &mut out, 4), 0);

        engine.stop();
    }

    #[test]
    fn test_drop_stops_workers() {
        let io = Arc::new(RingPorts::new(1, 1, 16));
        let mut engine = engine(1, io);
        engine.start().unwrap();
        drop(engine);
    }
}
