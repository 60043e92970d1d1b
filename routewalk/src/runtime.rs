//! Single-consumer event loop driving a [`SessionController`].
//!
//! Motion samples, location fixes, permission results and user commands are
//! all funneled through one channel and handled to completion in arrival
//! order. The elapsed-time ticker is a separate task that only exists while
//! a session is active; it is aborted as soon as the session leaves Active.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::route::FixFilter;
use crate::session::{DisplaySnapshot, SessionController, SessionStatus, SessionSummary};
use crate::{GeoFix, LocationPermission, MotionSample, SessionError};

const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("session event loop has shut down")]
    Closed,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug)]
enum SessionEvent {
    Motion(MotionSample),
    Fix(GeoFix),
    Permission(LocationPermission),
    Tick,
    Start(oneshot::Sender<Result<(), SessionError>>),
    End(oneshot::Sender<Result<SessionSummary, SessionError>>),
    Snapshot(oneshot::Sender<DisplaySnapshot>),
    Shutdown,
}

/// Cloneable front door to a running [`EventLoop`].
#[derive(Clone, Debug)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    min_fix_distance_m: f64,
}

impl SessionHandle {
    async fn send(&self, event: SessionEvent) -> Result<(), RuntimeError> {
        self.events.send(event).await.map_err(|_| RuntimeError::Closed)
    }

    pub async fn motion(&self, sample: MotionSample) -> Result<(), RuntimeError> {
        self.send(SessionEvent::Motion(sample)).await
    }

    pub async fn fix(&self, fix: GeoFix) -> Result<(), RuntimeError> {
        self.send(SessionEvent::Fix(fix)).await
    }

    pub async fn permission(&self, permission: LocationPermission) -> Result<(), RuntimeError> {
        self.send(SessionEvent::Permission(permission)).await
    }

    /// Request an immediate elapsed-time refresh outside the ticker cadence.
    pub async fn tick(&self) -> Result<(), RuntimeError> {
        self.send(SessionEvent::Tick).await
    }

    /// Start a session. An ended session is replaced by a fresh one first.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionEvent::Start(tx)).await?;
        Ok(rx.await.map_err(|_| RuntimeError::Closed)??)
    }

    pub async fn end(&self) -> Result<SessionSummary, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionEvent::End(tx)).await?;
        Ok(rx.await.map_err(|_| RuntimeError::Closed)??)
    }

    pub async fn snapshot(&self) -> Result<DisplaySnapshot, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionEvent::Snapshot(tx)).await?;
        rx.await.map_err(|_| RuntimeError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.send(SessionEvent::Shutdown).await
    }

    /// Forward a motion stream into the loop for as long as the returned
    /// subscription lives.
    pub fn attach_motion(&self, mut samples: mpsc::Receiver<MotionSample>) -> Subscription {
        let handle = self.clone();
        Subscription::spawn("motion", async move {
            while let Some(sample) = samples.recv().await {
                if handle.motion(sample).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Await the permission decision, then forward fixes spaced at least
    /// `min_fix_distance_m` (from the controller config) apart. Nothing is
    /// forwarded if permission is denied.
    pub fn attach_location<P>(&self, permission: P, mut fixes: mpsc::Receiver<GeoFix>) -> Subscription
    where
        P: Future<Output = LocationPermission> + Send + 'static,
    {
        let handle = self.clone();
        let min_distance_m = self.min_fix_distance_m;
        Subscription::spawn("location", async move {
            let granted = permission.await;
            if handle.permission(granted).await.is_err() {
                return;
            }
            if granted != LocationPermission::Granted {
                warn!(?granted, "location updates unavailable");
                return;
            }
            let mut filter = FixFilter::new(min_distance_m);
            while let Some(fix) = fixes.recv().await {
                if !filter.accept(&fix) {
                    continue;
                }
                if handle.fix(fix).await.is_err() {
                    break;
                }
            }
        })
    }
}

/// A sensor subscription that is released when dropped.
#[derive(Debug)]
pub struct Subscription {
    name: &'static str,
    task: JoinHandle<()>,
}

impl Subscription {
    fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(name, "subscription acquired");
        Self {
            name,
            task: tokio::spawn(fut),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        debug!(name = self.name, "subscription released");
    }
}

pub struct EventLoop {
    controller: SessionController,
    events: mpsc::Receiver<SessionEvent>,
    ticks_tx: mpsc::Sender<()>,
    ticks: mpsc::Receiver<()>,
    ticker: Option<JoinHandle<()>>,
    tick_interval: Duration,
}

impl EventLoop {
    pub fn new(controller: SessionController) -> (Self, SessionHandle) {
        let tick_interval = Duration::from_millis(controller.config().tick_interval_ms.max(1));
        let min_fix_distance_m = controller.config().min_fix_distance_m;
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        // one pending tick is enough; extra ticks are coalesced
        let (ticks_tx, ticks) = mpsc::channel(1);
        let event_loop = Self {
            controller,
            events,
            ticks_tx,
            ticks,
            ticker: None,
            tick_interval,
        };
        let handle = SessionHandle {
            events: events_tx,
            min_fix_distance_m,
        };
        (event_loop, handle)
    }

    /// Process events until shutdown or until every handle is dropped, then
    /// hand the controller back.
    pub async fn run(mut self) -> SessionController {
        info!(tick_ms = self.tick_interval.as_millis() as u64, "session event loop running");
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SessionEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event),
                },
                Some(()) = self.ticks.recv() => self.on_tick(),
            }
        }
        self.stop_ticker();
        info!(status = %self.controller.status(), "session event loop stopped");
        self.controller
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Motion(sample) => {
                self.controller.observe(&sample);
            }
            SessionEvent::Fix(fix) => {
                if let Err(err) = self.controller.on_fix(fix) {
                    debug!(error = %err, "location fix ignored");
                }
            }
            SessionEvent::Permission(permission) => self.controller.set_permission(permission),
            SessionEvent::Tick => self.on_tick(),
            SessionEvent::Start(reply) => {
                let result = self.start();
                let _ = reply.send(result);
            }
            SessionEvent::End(reply) => {
                let result = self.controller.end();
                if self.controller.status() != SessionStatus::Active {
                    self.stop_ticker();
                }
                let _ = reply.send(result);
            }
            SessionEvent::Snapshot(reply) => {
                let _ = reply.send(self.controller.snapshot());
            }
            SessionEvent::Shutdown => {}
        }
    }

    fn start(&mut self) -> Result<(), SessionError> {
        if self.controller.status() == SessionStatus::Ended {
            self.controller.new_session()?;
        }
        self.controller.start()?;
        self.start_ticker();
        Ok(())
    }

    fn on_tick(&mut self) {
        if self.controller.tick().is_none() {
            // a stale tick raced the session ending
            self.stop_ticker();
        }
    }

    fn start_ticker(&mut self) {
        self.stop_ticker();
        let period = self.tick_interval;
        let ticks = self.ticks_tx.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if ticks.try_send(()).is_err() && ticks.is_closed() {
                    break;
                }
            }
        }));
        debug!("elapsed ticker started");
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            debug!("elapsed ticker stopped");
        }
    }
}
