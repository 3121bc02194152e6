//! Backend adapters.
//!
//! | Adapter          | Implements     | Runs on        |
//! |------------------|----------------|----------------|
//! | `QueuedBackend`  | BackendPort    | comm thread    |
//! | `OfflineBackend` | BackendClient  | protocol task  |
//!
//! `QueuedBackend` turns every outward call into a [`BackendRequest`] on
//! a bounded channel so the comm thread never waits on the network.
//! `OfflineBackend` stands in for the OCPP library when the station runs
//! without a central system: local starts are accepted on the spot and
//! numbered from 1.

use std::collections::VecDeque;

use log::{info, warn};

use crate::app::ports::{
    Alert, BackendClient, BackendNotification, BackendPort, BackendRequest, EvseReadings, IdTag,
};
use crate::channels::BackendChannel;
use crate::gate::{StopReason, TransactionId};

// ───────────────────────────────────────────────────────────────
// QueuedBackend
// ───────────────────────────────────────────────────────────────

pub struct QueuedBackend {
    channel: &'static BackendChannel,
}

impl QueuedBackend {
    pub fn new(channel: &'static BackendChannel) -> Self {
        Self { channel }
    }

    fn push(&mut self, request: BackendRequest) {
        if let Err(e) = self.channel.try_send(request) {
            warn!("OCPP | request queue full, dropped {:?}", e);
        }
    }
}

impl BackendPort for QueuedBackend {
    fn send_alert(&mut self, alert: Alert) {
        self.push(BackendRequest::Alert(alert));
    }

    fn request_stop(&mut self, reason: StopReason) {
        self.push(BackendRequest::Stop(reason));
    }

    fn request_start(&mut self, id_tag: &str) {
        let mut tag = IdTag::new();
        for c in id_tag.chars() {
            if tag.push(c).is_err() {
                break;
            }
        }
        self.push(BackendRequest::Start(tag));
    }

    fn notify_fault(&mut self, faulted: bool) {
        self.push(BackendRequest::Fault(faulted));
    }
}

// ───────────────────────────────────────────────────────────────
// OfflineBackend
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OfflineBackend {
    authorized: bool,
    faulted: bool,
    next_transaction: TransactionId,
    notes: VecDeque<BackendNotification>,
    last_energy_wh: u32,
}

impl OfflineBackend {
    pub fn new() -> Self {
        Self {
            next_transaction: 1,
            ..Default::default()
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }
}

impl BackendClient for OfflineBackend {
    fn poll(&mut self, readings: &dyn EvseReadings) {
        self.last_energy_wh = readings.energy_wh();
    }

    fn is_charging_authorized(&self) -> bool {
        self.authorized
    }

    fn deliver(&mut self, request: BackendRequest) {
        match request {
            BackendRequest::Start(tag) => {
                if self.faulted {
                    warn!("OCPP | offline: start for {tag} refused, connector faulted");
                    return;
                }
                let id = self.next_transaction;
                self.next_transaction = self.next_transaction.wrapping_add(1).max(1);
                self.authorized = true;
                info!("OCPP | offline: transaction {id} for {tag}");
                self.notes.push_back(BackendNotification::TransactionStarted(id));
            }
            BackendRequest::Stop(reason) => {
                if self.authorized {
                    info!(
                        "OCPP | offline: transaction stopped ({reason}), meter {} Wh",
                        self.last_energy_wh
                    );
                    self.authorized = false;
                    self.notes.push_back(BackendNotification::TransactionStopped);
                }
            }
            BackendRequest::Fault(faulted) => self.faulted = faulted,
            BackendRequest::Alert(alert) => {
                warn!("OCPP | offline: alert {} ({alert})", alert.message_id());
            }
        }
    }

    fn respond_remote_start(&mut self, _accepted: bool) {}

    fn take_notification(&mut self) -> Option<BackendNotification> {
        self.notes.pop_front()
    }
}
