//! Per-device polling state machine and the tasks that drive it.
//!
//! A cycle walks `Idle → Triggering → AwaitingConversion → Reading →
//! Fusing → Publishing → Idle`. [`Bme68xComponent::update`] is the interval
//! tick that starts a cycle; [`Bme68xComponent::poll`] is the main-loop tick
//! that advances it as far as it can without waiting. Neither sleeps, so the
//! caller owns time.

use crate::bus::I2cTransport;
use crate::config::{DeviceConfig, SensorEntry};
use crate::dispatch::OutputDispatcher;
use crate::errors::{FusionError, SensorError, SetupError, StateError};
use crate::fusion::{Accuracy, FusedOutput, FusionBridge};
use crate::sensors::{Bme68x, RawSample};
use crate::state_store::StateStore;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Triggering,
    AwaitingConversion { ready_at: Instant },
    Reading { attempt: u32, next_attempt_at: Instant },
    Fusing,
    Publishing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleFailure {
    /// Bus error or a driver rejection
    Sensor(SensorError),
    /// The device never flagged new data
    NotReady { attempts: u32 },
    Fusion(FusionError),
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleFailure::Sensor(e) => write!(f, "{}", e),
            CycleFailure::NotReady { attempts } => write!(f, "no new data after {} read attempt(s)", attempts),
            CycleFailure::Fusion(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed { published: usize },
    /// Raw values may still have been published on a fusion failure
    Failed { failure: CycleFailure, published: usize },
}

impl CycleOutcome {
    pub fn published(&self) -> usize {
        match self {
            CycleOutcome::Completed { published } | CycleOutcome::Failed { published, .. } => *published,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    /// Interval ticks that arrived while a cycle was still running
    pub skipped_ticks: u64,
    pub values_published: u64,
    pub state_saves: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePolicy {
    pub max_read_attempts: u32,
    pub read_backoff: Duration,
    pub publish_raw_on_fusion_failure: bool,
    pub state_save_interval: Duration,
    /// Main-loop tick of the runner
    pub loop_interval: Duration,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            max_read_attempts: 3,
            read_backoff: Duration::from_millis(10),
            publish_raw_on_fusion_failure: true,
            state_save_interval: Duration::from_secs(6 * 60 * 60),
            loop_interval: Duration::from_millis(10),
        }
    }
}

impl From<&SensorEntry> for CyclePolicy {
    fn from(entry: &SensorEntry) -> Self {
        Self {
            max_read_attempts: entry.max_read_attempts,
            read_backoff: Duration::from_millis(entry.read_backoff_ms),
            publish_raw_on_fusion_failure: entry.publish_raw_on_fusion_failure,
            state_save_interval: Duration::from_secs(entry.state_save_interval_s),
            loop_interval: Duration::from_millis(entry.loop_interval_ms),
        }
    }
}

pub struct Bme68xComponent<T> {
    config: DeviceConfig,
    driver: Bme68x<T>,
    fusion: FusionBridge,
    dispatcher: OutputDispatcher,
    store: Option<Box<dyn StateStore>>,
    policy: CyclePolicy,
    phase: CyclePhase,
    epoch: Instant,
    sample: Option<RawSample>,
    fused: Option<FusedOutput>,
    fusion_error: Option<FusionError>,
    last_sample: Option<RawSample>,
    last_state_save: Instant,
    stats: CycleStats,
}

impl<T: I2cTransport> Bme68xComponent<T> {
    pub fn new(
        config: DeviceConfig,
        driver: Bme68x<T>,
        fusion: FusionBridge,
        dispatcher: OutputDispatcher,
        policy: CyclePolicy,
    ) -> Self {
        let now = Instant::now();
        Self {
            config,
            driver,
            fusion,
            dispatcher,
            store: None,
            policy,
            phase: CyclePhase::Idle,
            epoch: now,
            sample: None,
            fused: None,
            fusion_error: None,
            last_sample: None,
            last_state_save: now,
            stats: CycleStats::default(),
        }
    }

    pub fn with_state_store(mut self, store: Box<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn policy(&self) -> &CyclePolicy {
        &self.policy
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Most recent sample read from the device
    pub fn last_sample(&self) -> Option<&RawSample> {
        self.last_sample.as_ref()
    }

    /// Initialize the device and the fusion library, then restore any
    /// saved fusion state. `now` becomes the component's time origin.
    pub async fn setup(&mut self, now: Instant) -> Result<(), SetupError> {
        self.driver.init().await?;
        if self.config.self_test {
            self.driver.self_test().await?;
        }
        self.fusion.initialize(self.config.model)?;

        if let Some(store) = &self.store {
            match store.load().await {
                Ok(Some(blob)) => match self.fusion.load_state(&blob) {
                    Ok(()) => info!("[{}] restored fusion state ({} bytes)", self.config.id, blob.len()),
                    Err(e) => warn!("[{}] ignoring saved fusion state: {}", self.config.id, e),
                },
                Ok(None) => debug!("[{}] no saved fusion state", self.config.id),
                Err(e) => warn!("[{}] could not read fusion state: {}", self.config.id, e),
            }
        }

        self.epoch = now;
        self.last_state_save = now;
        self.phase = CyclePhase::Idle;
        info!(
            "[{}] {} at {:#04x} ready, sampling every {:?}, {} output channel(s)",
            self.config.id,
            self.config.model,
            self.config.address,
            self.config.sample_interval,
            self.dispatcher.channel_count()
        );
        Ok(())
    }

    /// Interval tick. Starts a cycle unless one is still running, in which
    /// case the tick is skipped and counted.
    pub fn update(&mut self, _now: Instant) -> bool {
        if self.phase != CyclePhase::Idle {
            self.stats.skipped_ticks += 1;
            warn!(
                "[{}] update tick skipped, cycle still in {:?} ({} skipped so far)",
                self.config.id, self.phase, self.stats.skipped_ticks
            );
            return false;
        }
        self.stats.started += 1;
        self.phase = CyclePhase::Triggering;
        true
    }

    /// Main-loop tick. Returns the outcome when a cycle ends during this call.
    pub async fn poll(&mut self, now: Instant) -> Option<CycleOutcome> {
        loop {
            match self.phase {
                CyclePhase::Idle => return None,
                CyclePhase::Triggering => match self.driver.trigger_forced_measurement().await {
                    Ok(wait) => {
                        debug!("[{}] measurement triggered, ready in {:?}", self.config.id, wait);
                        self.phase = CyclePhase::AwaitingConversion { ready_at: now + wait };
                    }
                    Err(e) => return Some(self.fail(CycleFailure::Sensor(e))),
                },
                CyclePhase::AwaitingConversion { ready_at } => {
                    if now < ready_at {
                        return None;
                    }
                    self.phase = CyclePhase::Reading {
                        attempt: 1,
                        next_attempt_at: now,
                    };
                }
                CyclePhase::Reading {
                    attempt,
                    next_attempt_at,
                } => {
                    if now < next_attempt_at {
                        return None;
                    }
                    let timestamp = now.duration_since(self.epoch);
                    match self.driver.read_raw_sample(timestamp).await {
                        Ok(sample) => {
                            self.sample = Some(sample);
                            self.phase = CyclePhase::Fusing;
                        }
                        Err(SensorError::NotReady { .. }) if attempt < self.policy.max_read_attempts => {
                            debug!("[{}] data not ready (attempt {})", self.config.id, attempt);
                            self.phase = CyclePhase::Reading {
                                attempt: attempt + 1,
                                next_attempt_at: now + self.policy.read_backoff,
                            };
                        }
                        Err(SensorError::NotReady { .. }) => {
                            self.driver.abort();
                            return Some(self.fail(CycleFailure::NotReady { attempts: attempt }));
                        }
                        Err(e) => {
                            self.driver.abort();
                            return Some(self.fail(CycleFailure::Sensor(e)));
                        }
                    }
                }
                CyclePhase::Fusing => {
                    match self.sample.as_ref().map(|s| self.fusion.process(s)) {
                        Some(Ok(fused)) => self.fused = Some(fused),
                        Some(Err(e)) => self.fusion_error = Some(e),
                        None => self.fusion_error = Some(FusionError::NotInitialized),
                    }
                    self.phase = CyclePhase::Publishing;
                }
                CyclePhase::Publishing => return Some(self.publish(now).await),
            }
        }
    }

    async fn publish(&mut self, now: Instant) -> CycleOutcome {
        self.phase = CyclePhase::Idle;
        let fused = self.fused.take();
        let fusion_error = self.fusion_error.take();
        let Some(sample) = self.sample.take() else {
            return self.fail(CycleFailure::Sensor(SensorError::NotTriggered {
                sensor: self.config.id.clone(),
            }));
        };

        debug!(
            "[{}] T={:.2}°C P={:.2}hPa H={:.2}% G={:.0}Ω step={}",
            self.config.id,
            sample.temperature,
            sample.pressure,
            sample.humidity,
            sample.gas_resistance,
            sample.heater_step
        );
        self.last_sample = Some(sample);

        match fusion_error {
            None => {
                let published = self.dispatcher.dispatch(&sample, fused.as_ref());
                self.stats.completed += 1;
                self.stats.values_published += published as u64;
                if let Some(fused) = fused {
                    self.maybe_save_state(&fused, now).await;
                }
                CycleOutcome::Completed { published }
            }
            Some(e) => {
                let published = if self.policy.publish_raw_on_fusion_failure {
                    self.dispatcher.dispatch(&sample, None)
                } else {
                    0
                };
                self.stats.failed += 1;
                self.stats.values_published += published as u64;
                warn!(
                    "[{}] fusion failed: {} ({} raw value(s) published)",
                    self.config.id, e, published
                );
                CycleOutcome::Failed {
                    failure: CycleFailure::Fusion(e),
                    published,
                }
            }
        }
    }

    fn fail(&mut self, failure: CycleFailure) -> CycleOutcome {
        self.phase = CyclePhase::Idle;
        self.sample = None;
        self.fused = None;
        self.fusion_error = None;
        self.stats.failed += 1;
        warn!("[{}] cycle failed: {}", self.config.id, failure);
        CycleOutcome::Failed { failure, published: 0 }
    }

    async fn maybe_save_state(&mut self, fused: &FusedOutput, now: Instant) {
        if self.store.is_none()
            || fused.iaq.accuracy != Accuracy::High
            || now.duration_since(self.last_state_save) < self.policy.state_save_interval
        {
            return;
        }
        if let Err(e) = self.save_state(now).await {
            error!("[{}] saving fusion state failed: {}", self.config.id, e);
        }
    }

    /// Persist the fusion state. Returns `false` when no store is configured.
    pub async fn save_state(&mut self, now: Instant) -> Result<bool, StateError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let blob = self.fusion.save_state()?;
        store.save(&blob).await?;
        self.last_state_save = now;
        self.stats.state_saves += 1;
        info!("[{}] fusion state saved ({} bytes)", self.config.id, blob.len());
        Ok(true)
    }

    /// Drop any cycle in progress and persist the fusion state.
    pub async fn shutdown(&mut self, now: Instant) {
        if self.phase != CyclePhase::Idle {
            self.driver.abort();
            self.phase = CyclePhase::Idle;
            self.sample = None;
            self.fused = None;
            self.fusion_error = None;
        }
        if let Err(e) = self.save_state(now).await {
            error!("[{}] saving fusion state on shutdown failed: {}", self.config.id, e);
        }
        let s = self.stats;
        info!(
            "[{}] stopped: {} cycles, {} completed, {} failed, {} skipped ticks, {} values",
            self.config.id, s.started, s.completed, s.failed, s.skipped_ticks, s.values_published
        );
    }
}

/// Spawn one task per component. Each task returns its component once
/// `shutdown` flips to `true` or its sender is dropped.
pub fn spawn_sensor_tasks<T>(
    components: Vec<Bme68xComponent<T>>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<Bme68xComponent<T>>>
where
    T: I2cTransport + 'static,
{
    components
        .into_iter()
        .map(|component| tokio::spawn(run_component(component, shutdown.clone())))
        .collect()
}

async fn run_component<T: I2cTransport>(
    mut component: Bme68xComponent<T>,
    mut shutdown: watch::Receiver<bool>,
) -> Bme68xComponent<T> {
    let mut update = interval(component.config.sample_interval);
    update.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick = interval(component.policy.loop_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "[{}] starting sensor task, update every {:?}, loop every {:?}",
        component.config.id, component.config.sample_interval, component.policy.loop_interval
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = update.tick() => {
                component.update(Instant::now());
            }
            _ = tick.tick() => {
                if let Some(outcome) = component.poll(Instant::now()).await {
                    debug!("[{}] cycle ended: {:?}", component.config.id, outcome);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    component.shutdown(Instant::now()).await;
    component
}
