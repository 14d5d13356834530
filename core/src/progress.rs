/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Smoothing factor of the transfer-speed EMA.
const EMA_ALPHA: f64 = 0.4;
/// Width of one speed-sampling window.
const EMA_WINDOW: Duration = Duration::from_millis(200);
/// Minimum spacing between two published progress events. Events arriving
/// faster are coalesced to the latest.
const MIN_EVENT_INTERVAL: Duration = Duration::from_millis(16);

/// Phase tag carried by every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Connect,
    LoaderUpload,
    Configure,
    Extract,
    Flash,
    Erase,
    Wipe,
    Reboot,
}

impl std::fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlashPhase::Connect => "connect",
            FlashPhase::LoaderUpload => "loader-upload",
            FlashPhase::Configure => "configure",
            FlashPhase::Extract => "extract",
            FlashPhase::Flash => "flash",
            FlashPhase::Erase => "erase",
            FlashPhase::Wipe => "wipe",
            FlashPhase::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: FlashPhase,
    pub partition: Option<String>,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// EMA-smoothed transfer speed in bytes per second.
    pub speed_bps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub state: String,
}

/// Typed event stream the core publishes for front-ends.
#[derive(Debug, Clone)]
pub enum Event {
    Progress(ProgressEvent),
    Log(LogEvent),
    StateChanged(StateChangedEvent),
}

/// Publication side of the event stream.
///
/// Cloneable; per-session event order is preserved by the underlying
/// channel. A bus whose receiver has been dropped silently discards
/// events, so headless usage needs no special casing.
#[derive(Clone)]
pub struct ProgressBus {
    tx: UnboundedSender<Event>,
}

impl ProgressBus {
    pub fn new() -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (ProgressBus { tx }, rx)
    }

    /// A bus with no subscriber. Everything published is dropped.
    pub fn sink() -> Self {
        let (tx, _rx) = unbounded_channel();
        ProgressBus { tx }
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(Event::Log(LogEvent { level, message: message.into() }));
    }

    pub fn state_changed(&self, state: impl Into<String>) {
        self.emit(Event::StateChanged(StateChangedEvent { state: state.into() }));
    }

    /// Starts a progress reporter for one transfer.
    pub fn reporter(
        &self,
        phase: FlashPhase,
        partition: Option<&str>,
        bytes_total: u64,
    ) -> ProgressReporter {
        ProgressReporter {
            bus: self.clone(),
            phase,
            partition: partition.map(str::to_owned),
            bytes_done: 0,
            bytes_total,
            ema: SpeedEma::new(Instant::now()),
            last_emit: None,
        }
    }
}

/// Per-transfer progress accumulator with speed smoothing and event
/// coalescing.
pub struct ProgressReporter {
    bus: ProgressBus,
    phase: FlashPhase,
    partition: Option<String>,
    bytes_done: u64,
    bytes_total: u64,
    ema: SpeedEma,
    last_emit: Option<Instant>,
}

impl ProgressReporter {
    /// Records `n` freshly transferred bytes.
    pub fn add(&mut self, n: u64) {
        self.add_at(n, Instant::now());
    }

    /// Marks the transfer complete. The final event is never coalesced.
    pub fn finish(&mut self) {
        self.bytes_done = self.bytes_total;
        self.publish();
        self.last_emit = Some(Instant::now());
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn speed_bps(&self) -> f64 {
        self.ema.value()
    }

    fn add_at(&mut self, n: u64, now: Instant) {
        self.bytes_done += n;
        self.ema.push(n, now);

        let due = match self.last_emit {
            Some(t) => now.duration_since(t) >= MIN_EVENT_INTERVAL,
            None => true,
        };

        if due || self.bytes_done >= self.bytes_total {
            self.publish();
            self.last_emit = Some(now);
        }
    }

    fn publish(&self) {
        self.bus.emit(Event::Progress(ProgressEvent {
            phase: self.phase,
            partition: self.partition.clone(),
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            speed_bps: self.ema.value(),
        }));
    }
}

/// Exponential moving average over fixed-width sampling windows. Empty
/// windows decay the average toward zero.
struct SpeedEma {
    window_start: Instant,
    window_bytes: u64,
    value: Option<f64>,
}

impl SpeedEma {
    fn new(now: Instant) -> Self {
        SpeedEma { window_start: now, window_bytes: 0, value: None }
    }

    fn push(&mut self, n: u64, now: Instant) {
        while now.duration_since(self.window_start) >= EMA_WINDOW {
            let rate = self.window_bytes as f64 / EMA_WINDOW.as_secs_f64();
            self.value = Some(match self.value {
                Some(prev) => EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * prev,
                None => rate,
            });
            self.window_bytes = 0;
            self.window_start += EMA_WINDOW;
        }

        self.window_bytes += n;
    }

    fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_smooths_across_windows() {
        let t0 = Instant::now();
        let mut ema = SpeedEma::new(t0);

        // 200 KiB in the first window -> 1 MiB/s.
        ema.push(200 * 1024, t0);
        ema.push(0, t0 + EMA_WINDOW);
        let first = ema.value();
        assert!((first - 1024.0 * 1024.0).abs() < 1.0, "seed rate, got {first}");

        // An idle window decays the average by (1 - alpha).
        ema.push(0, t0 + 2 * EMA_WINDOW);
        let decayed = ema.value();
        assert!((decayed - first * (1.0 - EMA_ALPHA)).abs() < 1.0);
    }

    #[test]
    fn reporter_coalesces_bursts() {
        let (bus, mut rx) = ProgressBus::new();
        let mut reporter = bus.reporter(FlashPhase::Flash, Some("boot"), 1000);

        let t0 = Instant::now();
        // 10 sub-interval updates: only the first may be published.
        for i in 0..10 {
            reporter.add_at(10, t0 + Duration::from_millis(i));
        }

        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 1, "burst must coalesce to a single event");

        // Past the interval, the next update publishes again.
        reporter.add_at(10, t0 + Duration::from_millis(40));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn finish_always_publishes_the_terminal_event() {
        let (bus, mut rx) = ProgressBus::new();
        let mut reporter = bus.reporter(FlashPhase::Flash, None, 100);

        reporter.add(10);
        reporter.finish();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }

        match last {
            Some(Event::Progress(p)) => {
                assert_eq!(p.bytes_done, 100);
                assert_eq!(p.bytes_total, 100);
            }
            other => panic!("expected terminal progress event, got {other:?}"),
        }
    }

    #[test]
    fn sink_bus_discards_silently() {
        let bus = ProgressBus::sink();
        bus.log(LogLevel::Info, "nobody listens");
        bus.state_changed("fdl2");
    }
}
