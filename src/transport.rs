use std::time::Instant;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::ctap2::CtapEngine;
use crate::hid::{CtapHid, HidOutput, HID_REPORT_LEN};

/// Events consumed by the transport worker, strictly in receipt order.
/// Reports come from the USB ISR side; unlock ticks come from the
/// one-shot lock timer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Report([u8; HID_REPORT_LEN]),
    Unlock,
    Stop,
}

/// Byte-level transmit seam to the USB HID endpoint.
pub trait ReportSink: Send {
    fn send_report(&mut self, report: &[u8; HID_REPORT_LEN]) -> Result<()>;

    /// WINK indication for the device UI.
    fn wink(&mut self) {}
}

/// Handle held by the embedding application: the ISR posts reports, the
/// USB stack posts connect/disconnect, shutdown returns the engine so
/// the store can be inspected after teardown.
pub struct TransportHandle {
    events: UnboundedSender<TransportEvent>,
    worker: JoinHandle<CtapEngine>,
}

impl TransportHandle {
    pub fn deliver_report(&self, report: [u8; HID_REPORT_LEN]) {
        let _ = self.events.send(TransportEvent::Report(report));
    }

    pub fn connected(&self) {
        let _ = self.events.send(TransportEvent::Connected);
    }

    pub fn disconnected(&self) {
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    pub fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Stop the worker and take the engine back. The credential store is
    /// persisted before the worker exits.
    pub async fn shutdown(self) -> Result<CtapEngine> {
        let _ = self.events.send(TransportEvent::Stop);
        self.worker
            .await
            .map_err(|e| anyhow!("Transport worker panicked: {}", e))
    }
}

/// Spawn the transport worker. It owns the framing state machine, the
/// engine, and the sink; everything runs synchronously per event, so
/// responses are emitted before the next request is examined.
pub fn spawn(engine: CtapEngine, sink: Box<dyn ReportSink>) -> TransportHandle {
    let (events, receiver) = mpsc::unbounded_channel();
    let timer_events = events.clone();
    let worker = tokio::spawn(run_worker(engine, sink, receiver, timer_events));
    TransportHandle { events, worker }
}

async fn run_worker(
    mut engine: CtapEngine,
    mut sink: Box<dyn ReportSink>,
    mut events: UnboundedReceiver<TransportEvent>,
    timer_events: UnboundedSender<TransportEvent>,
) -> CtapEngine {
    let mut hid = CtapHid::new();
    log::info!("Transport worker started");

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                log::info!("Host connected");
                hid.reset();
            }
            TransportEvent::Disconnected => {
                log::info!("Host disconnected");
                hid.reset();
            }
            TransportEvent::Report(report) => {
                let output = hid.handle_report(&report, &mut engine, Instant::now());
                flush(sink.as_mut(), output, &timer_events);
            }
            TransportEvent::Unlock => hid.expire_lock(Instant::now()),
            TransportEvent::Stop => {
                log::info!("Transport worker stopping");
                break;
            }
        }
    }

    if let Err(e) = engine.store().persist() {
        log::error!("Failed to persist credential store: {}", e);
    }
    log::info!("Transport worker stopped");
    engine
}

fn flush(sink: &mut dyn ReportSink, output: HidOutput, timer_events: &UnboundedSender<TransportEvent>) {
    if output.wink {
        sink.wink();
    }
    for report in &output.reports {
        if let Err(e) = sink.send_report(report) {
            log::error!("Failed to transmit report: {}", e);
            break;
        }
    }
    if let Some(hold) = output.lock_timer {
        let events = timer_events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let _ = events.send(TransportEvent::Unlock);
        });
    }
}
