use std::{sync::Arc, time::Duration};

use chrono::{Local, NaiveDateTime};
use memwake_core::{
    config::{WORK_NAME_DEBUG, WORK_NAME_SLOT_1, WORK_NAME_SLOT_2},
    HourWindow,
};
use rand::Rng;
use tracing::{error, info};

use crate::{
    error::Result,
    queue::WorkQueue,
    schedule::compute_schedule_set,
    types::{
        BackoffPolicy, ExistingWorkPolicy, JobSubmission, OutOfQuotaPolicy, ScheduleSet,
        WakeSlot, WorkRequest,
    },
};

/// Re-arms the recurring schedule. Called once per terminated execution.
pub trait Rescheduler: Send + Sync {
    fn reschedule_next(&self) -> Result<()>;
}

/// Turns wake slots and ad-hoc delays into unique-name queue submissions.
pub struct WorkSubmitter<Q: WorkQueue + ?Sized> {
    queue: Arc<Q>,
    window: HourWindow,
    backoff: BackoffPolicy,
}

impl<Q: WorkQueue + ?Sized> WorkSubmitter<Q> {
    /// `window` is expected to be validated already.
    pub fn new(queue: Arc<Q>, window: HourWindow, backoff_base: Duration) -> Self {
        Self {
            queue,
            window,
            backoff: BackoffPolicy::exponential(backoff_base),
        }
    }

    /// Build the submission for `name` without sending it.
    pub fn submission(&self, name: &str, delay: Duration, expedite: bool) -> JobSubmission {
        let mut request = WorkRequest::new(delay, self.backoff);
        if expedite {
            request = request.expedite(OutOfQuotaPolicy::RunAsNonExpedited);
        }
        JobSubmission {
            unique_name: name.to_string(),
            request,
        }
    }

    /// Submit one run under `name`, replacing any queued or running work of
    /// that name. Queue errors are returned as-is; nothing is retried here.
    pub fn submit(&self, name: &str, delay: Duration, expedite: bool) -> Result<()> {
        let JobSubmission {
            unique_name,
            request,
        } = self.submission(name, delay, expedite);
        self.queue
            .enqueue_unique_work(&unique_name, ExistingWorkPolicy::Replace, request)
    }

    /// Ad-hoc diagnostic run under the debug name. A zero delay is expedited.
    pub fn schedule_debug(&self, delay: Duration) -> Result<()> {
        self.submit(WORK_NAME_DEBUG, delay, delay.is_zero())?;
        info!(delay_secs = delay.as_secs(), "scheduled debug worker");
        Ok(())
    }

    /// Compute a fresh schedule from the thread RNG and submit both slots.
    pub fn reschedule(&self, now: NaiveDateTime) -> Result<ScheduleSet> {
        self.reschedule_with_rng(now, &mut rand::thread_rng())
    }

    /// Like [`Self::reschedule`] with an injected random source.
    ///
    /// Each slot is submitted independently: both are attempted even when the
    /// first fails, and the first error is returned.
    pub fn reschedule_with_rng<R: Rng + ?Sized>(
        &self,
        now: NaiveDateTime,
        rng: &mut R,
    ) -> Result<ScheduleSet> {
        let set = compute_schedule_set(now, self.window, rng);
        let mut first_err = None;

        for slot in set.tag([WORK_NAME_SLOT_1, WORK_NAME_SLOT_2]) {
            if let Err(e) = self.submit_slot(now, &slot) {
                error!(name = %slot.name, at = %slot.at, "slot submission failed: {e}");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(set),
        }
    }

    fn submit_slot(&self, now: NaiveDateTime, slot: &WakeSlot) -> Result<()> {
        // A slot in the past runs immediately rather than failing.
        let delay = (slot.at - now).to_std().unwrap_or(Duration::ZERO);
        self.submit(&slot.name, delay, false)?;
        info!(
            name = %slot.name,
            delay_secs = delay.as_secs(),
            at = %slot.at,
            "scheduled wake slot"
        );
        Ok(())
    }
}

impl<Q: WorkQueue + ?Sized> Rescheduler for WorkSubmitter<Q> {
    fn reschedule_next(&self) -> Result<()> {
        self.reschedule(Local::now().naive_local()).map(|_| ())
    }
}
