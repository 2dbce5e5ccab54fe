// Postpone Scheduler
// Remembers "remind me later" choices and re-prompts on a timer

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::auto_update::config::UpdateConfig;
use crate::auto_update::events::{AvailablePrompt, UiBus, UiEvent, Urgency};
use crate::auto_update::release_notes::ReleaseNotesCache;
use crate::auto_update::types::UpdateInfo;

#[derive(Default)]
struct PostponeRecord {
    pending: Option<UpdateInfo>,
    count: u32,
    reminder: Option<JoinHandle<()>>,
}

impl PostponeRecord {
    fn cancel_reminder(&mut self) {
        if let Some(handle) = self.reminder.take() {
            handle.abort();
        }
    }

    fn reset(&mut self) {
        self.cancel_reminder();
        self.pending = None;
        self.count = 0;
    }
}

fn urgency_for(count: u32, max_postpone: u32) -> Urgency {
    if count >= max_postpone {
        Urgency::Escalated
    } else {
        Urgency::Normal
    }
}

pub struct PostponeScheduler {
    max_postpone: u32,
    reminder_interval: Duration,
    bus: UiBus,
    notes: Arc<ReleaseNotesCache>,
    record: Arc<Mutex<PostponeRecord>>,
}

impl PostponeScheduler {
    pub fn new(config: &UpdateConfig, bus: UiBus, notes: Arc<ReleaseNotesCache>) -> Self {
        Self {
            max_postpone: config.max_postpone,
            reminder_interval: config.reminder_interval(),
            bus,
            notes,
            record: Arc::new(Mutex::new(PostponeRecord::default())),
        }
    }

    /// Defer `info` and (re)arm the reminder. Returns the postpone count.
    /// Must be called from within a tokio runtime.
    pub fn postpone(&self, info: &UpdateInfo) -> u32 {
        let mut record = self.record.lock();

        let same_version = record
            .pending
            .as_ref()
            .is_some_and(|pending| pending.version == info.version);
        if !same_version {
            record.count = 0;
        }

        record.count = (record.count + 1).min(self.max_postpone);
        record.pending = Some(info.clone());
        record.cancel_reminder();
        record.reminder = Some(self.spawn_reminder());

        log::info!(
            "[PostponeScheduler] Update {} postponed ({}/{}), reminding in {:?}",
            info.version,
            record.count,
            self.max_postpone,
            self.reminder_interval
        );
        record.count
    }

    fn spawn_reminder(&self) -> JoinHandle<()> {
        let record = Arc::clone(&self.record);
        let bus = self.bus.clone();
        let notes = Arc::clone(&self.notes);
        let interval = self.reminder_interval;
        let max_postpone = self.max_postpone;

        tokio::spawn(async move {
            tokio::time::sleep(interval).await;

            let (info, count) = {
                let mut record = record.lock();
                record.reminder = None;
                match record.pending.clone() {
                    Some(info) => (info, record.count),
                    None => return,
                }
            };

            let urgency = urgency_for(count, max_postpone);
            log::info!(
                "[PostponeScheduler] Reminding about {} ({:?})",
                info.version,
                urgency
            );
            bus.publish(UiEvent::Available(AvailablePrompt {
                release_notes: notes.format(&info),
                info,
                urgency,
                postpone_count: count,
            }));
        })
    }

    /// A different version resets the count and drops the reminder
    pub fn on_new_version_observed(&self, info: &UpdateInfo) {
        let mut record = self.record.lock();
        let differs = record
            .pending
            .as_ref()
            .is_some_and(|pending| pending.version != info.version);
        if differs {
            log::info!(
                "[PostponeScheduler] New version {} observed, resetting postpone state",
                info.version
            );
            record.reset();
        }
    }

    pub fn on_downloaded(&self) {
        self.record.lock().reset();
    }

    pub fn postpone_count(&self) -> u32 {
        self.record.lock().count
    }

    /// Urgency the next prompt for the postponed version should carry
    pub fn urgency(&self) -> Urgency {
        urgency_for(self.record.lock().count, self.max_postpone)
    }

    pub fn pending_version(&self) -> Option<String> {
        self.record
            .lock()
            .pending
            .as_ref()
            .map(|info| info.version.clone())
    }

    pub fn has_reminder(&self) -> bool {
        self.record.lock().reminder.is_some()
    }

    pub fn shutdown(&self) {
        self.record.lock().cancel_reminder();
    }
}
