//! Exclusive access to the single ejector.
//!
//! One task owns the [EjectionSequencer] and every rack's [SlotTracker].
//! Pipelines send it ejection requests over a channel and wait for the
//! reply; requests are served strictly one at a time, in arrival order.
//! Each sequence runs in its own task, so a crash inside one fails only that
//! request.

use std::{collections::BTreeMap, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::RackConfig,
    sequencer::{EjectionRequest, EjectionSequencer, SequenceReport},
    EjectionError, SlotPolicy, SlotTracker,
};

/// Result of one ejection, as seen by the requesting pipeline.
#[derive(Debug)]
pub struct EjectionOutcome {
    /// What the sequencer did.
    pub report: SequenceReport,
    /// Store slot actually used.
    pub store_slot: Option<u32>,
    /// Grab slot actually used.
    pub grab_slot: Option<u32>,
    /// When this request got the ejector.
    pub acquired_at: Instant,
    /// When this request gave it back.
    pub released_at: Instant,
}

/// Published state of the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorState {
    /// Printer currently holding the ejector.
    pub serving: Option<String>,
    /// Next store slot of every rotating rack.
    pub next_slots: BTreeMap<String, u32>,
    /// Sequences run so far.
    pub sequences: u64,
}

struct Ticket {
    request: EjectionRequest,
    reply: oneshot::Sender<EjectionOutcome>,
}

struct RackSlots {
    tracker: SlotTracker,
    grab_slot: u32,
}

/// Cheap, cloneable handle pipelines use to request ejections.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tickets: mpsc::UnboundedSender<Ticket>,
    state: watch::Receiver<CoordinatorState>,
}

impl CoordinatorHandle {
    /// Queue an ejection and wait until it has run.
    pub async fn eject(&self, request: EjectionRequest) -> Result<EjectionOutcome, EjectionError> {
        let (reply, outcome) = oneshot::channel();
        tracing::info!(printer = request.printer, job = request.job, "requesting ejector");
        self.tickets
            .send(Ticket { request, reply })
            .map_err(|_| EjectionError::CoordinatorGone)?;
        outcome.await.map_err(|_| EjectionError::CoordinatorGone)
    }

    /// Latest published state.
    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }
}

/// Start the coordinator task. It runs until every handle is dropped.
pub fn spawn(sequencer: EjectionSequencer, racks: &BTreeMap<String, RackConfig>) -> (CoordinatorHandle, JoinHandle<()>) {
    let mut slots = BTreeMap::new();
    for (label, rack) in racks.iter() {
        if let Some(tracker) = SlotTracker::new(rack.shelves, rack.start_slot) {
            slots.insert(
                label.clone(),
                RackSlots {
                    tracker,
                    grab_slot: rack.grab_slot,
                },
            );
        }
    }

    let (tickets, rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(CoordinatorState {
        serving: None,
        next_slots: next_slots(&slots),
        sequences: 0,
    });

    let task = tokio::spawn(serve(Arc::new(sequencer), slots, rx, state_tx));
    (CoordinatorHandle { tickets, state }, task)
}

fn next_slots(slots: &BTreeMap<String, RackSlots>) -> BTreeMap<String, u32> {
    slots.iter().map(|(label, s)| (label.clone(), s.tracker.current())).collect()
}

async fn serve(
    sequencer: Arc<EjectionSequencer>,
    mut slots: BTreeMap<String, RackSlots>,
    mut tickets: mpsc::UnboundedReceiver<Ticket>,
    state: watch::Sender<CoordinatorState>,
) {
    while let Some(Ticket { mut request, reply }) = tickets.recv().await {
        let acquired_at = Instant::now();
        tracing::info!(printer = request.printer, job = request.job, "ejector acquired");
        state.send_modify(|s| s.serving = Some(request.printer.clone()));

        let rack = match &request.slots {
            SlotPolicy::Rotating { rack } => slots.get_mut(rack),
            SlotPolicy::Explicit => None,
        };
        if let Some(rack) = rack.as_ref() {
            request.params.store_slot = Some(rack.tracker.current());
            request.params.grab_slot = request.params.grab_slot.map(|_| rack.grab_slot);
        }

        let run = {
            let sequencer = sequencer.clone();
            let request = request.clone();
            tokio::spawn(async move { sequencer.run(&request).await })
        };
        let report = match run.await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(
                    printer = request.printer,
                    job = request.job,
                    error = %err,
                    "ejection sequence crashed"
                );
                SequenceReport::aborted(err.to_string())
            }
        };

        if let Some(rack) = rack {
            if report.stored() {
                let next = rack.tracker.advance();
                tracing::info!(printer = request.printer, next_slot = next, "store slot advanced");
            }
        }

        let released_at = Instant::now();
        tracing::info!(
            printer = request.printer,
            job = request.job,
            success = report.is_success(),
            held = ?released_at.duration_since(acquired_at),
            "ejector released"
        );
        state.send_modify(|s| {
            s.serving = None;
            s.next_slots = next_slots(&slots);
            s.sequences += 1;
        });

        let outcome = EjectionOutcome {
            report,
            store_slot: request.params.store_slot,
            grab_slot: request.params.grab_slot,
            acquired_at,
            released_at,
        };
        if reply.send(outcome).is_err() {
            tracing::warn!(printer = request.printer, "requester went away before the ejection finished");
        }
    }
    tracing::debug!("all coordinator handles dropped, stopping");
}
