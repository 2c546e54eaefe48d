use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use chrono_tz::Asia::Shanghai;

use crate::contracts::PipelineResult;

type JobFuture = Pin<Box<dyn Future<Output = PipelineResult<()>> + Send>>;
type JobAction = Box<dyn Fn() -> JobFuture + Send + Sync>;

/// When a job fires, in the operational time zone.
#[derive(Debug, Clone, Copy)]
pub enum Cadence {
    Every(Duration),
    DailyAt { hour: u32, minute: u32 },
    WeeklyOn { weekday: Weekday, hour: u32, minute: u32 },
}

impl Cadence {
    /// The first trigger strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Cadence::Every(interval) => now + *interval,
            Cadence::DailyAt { hour, minute } => {
                let local = now.with_timezone(&Shanghai);
                let mut date = local.date_naive();
                loop {
                    if let Some(candidate) = date
                        .and_hms_opt(*hour, *minute, 0)
                        .and_then(|naive| Shanghai.from_local_datetime(&naive).earliest())
                    {
                        let candidate = candidate.with_timezone(&Utc);
                        if candidate > now {
                            return candidate;
                        }
                    }
                    date += Duration::days(1);
                }
            }
            Cadence::WeeklyOn {
                weekday,
                hour,
                minute,
            } => {
                let local = now.with_timezone(&Shanghai);
                let mut date = local.date_naive();
                loop {
                    if date.weekday() == *weekday {
                        if let Some(candidate) = date
                            .and_hms_opt(*hour, *minute, 0)
                            .and_then(|naive| Shanghai.from_local_datetime(&naive).earliest())
                        {
                            let candidate = candidate.with_timezone(&Utc);
                            if candidate > now {
                                return candidate;
                            }
                        }
                    }
                    date += Duration::days(1);
                }
            }
        }
    }
}

struct Job {
    name: String,
    cadence: Cadence,
    next_due: DateTime<Utc>,
    action: JobAction,
}

/// # NDOC
/// component: `scheduler`
/// purpose: Fixed-interval trigger loop, single-threaded and cooperative.
/// invariants:
///   - At most one job runs at a time.
///   - Triggers that pass while a job is active are skipped, not queued.
pub struct Scheduler {
    jobs: Vec<Job>,
    check_interval: std::time::Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            check_interval: std::time::Duration::from_secs(60),
        }
    }

    pub fn add_job<F>(&mut self, name: impl Into<String>, cadence: Cadence, action: F)
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        let name = name.into();
        let next_due = cadence.next_after(Utc::now());
        log::info!("job '{}' scheduled, first run at {}", name, next_due);
        self.jobs.push(Job {
            name,
            cadence,
            next_due,
            action: Box::new(action),
        });
    }

    /// Runs every due job once, sequentially. Trigger points that passed more
    /// than once since the last run collapse into a single execution.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        for i in 0..self.jobs.len() {
            if self.jobs[i].next_due > now {
                continue;
            }
            let mut passed = 0usize;
            let mut cursor = self.jobs[i].next_due;
            while cursor <= now {
                cursor = self.jobs[i].cadence.next_after(cursor);
                passed += 1;
            }
            if passed > 1 {
                log::warn!(
                    "job '{}' skipped {} triggers that passed while busy",
                    self.jobs[i].name,
                    passed - 1
                );
            }

            log::info!("job '{}' starting", self.jobs[i].name);
            let started = std::time::Instant::now();
            match (self.jobs[i].action)().await {
                Ok(()) => log::info!(
                    "job '{}' finished in {:?}",
                    self.jobs[i].name,
                    started.elapsed()
                ),
                Err(err) => log::error!("job '{}' failed: {}", self.jobs[i].name, err),
            }
            // Reschedule from completion time so a long run never queues a
            // make-up execution.
            self.jobs[i].next_due = self.jobs[i].cadence.next_after(Utc::now());
        }
    }

    /// The blocking scheduler loop.
    pub async fn run(&mut self) {
        log::info!("scheduler loop started ({} jobs)", self.jobs.len());
        loop {
            tokio::time::sleep(self.check_interval).await;
            self.tick(Utc::now()).await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_cadence_rolls_to_tomorrow_after_the_trigger() {
        let cadence = Cadence::DailyAt { hour: 9, minute: 30 };
        // 2026-01-16 10:00 Shanghai is 02:00 UTC.
        let next = cadence.next_after(utc("2026-01-16T02:00:00Z"));
        let local = next.with_timezone(&Shanghai);
        assert_eq!(local.date_naive().to_string(), "2026-01-17");
        assert_eq!(chrono::Timelike::hour(&local), 9);
        assert_eq!(chrono::Timelike::minute(&local), 30);
    }

    #[test]
    fn daily_cadence_fires_later_today_before_the_trigger() {
        let cadence = Cadence::DailyAt { hour: 9, minute: 30 };
        // 2026-01-16 08:00 Shanghai is 00:00 UTC.
        let next = cadence.next_after(utc("2026-01-16T00:00:00Z"));
        assert_eq!(
            next.with_timezone(&Shanghai).date_naive().to_string(),
            "2026-01-16"
        );
    }

    #[test]
    fn weekly_cadence_lands_on_the_requested_weekday() {
        let cadence = Cadence::WeeklyOn {
            weekday: Weekday::Mon,
            hour: 10,
            minute: 0,
        };
        // 2026-01-16 is a Friday.
        let next = cadence.next_after(utc("2026-01-16T02:00:00Z"));
        let local = next.with_timezone(&Shanghai);
        assert_eq!(local.weekday(), Weekday::Mon);
        assert_eq!(local.date_naive().to_string(), "2026-01-19");
    }

    #[tokio::test]
    async fn due_job_runs_once_and_advances() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let counted = counter.clone();
        scheduler.add_job("ingest", Cadence::Every(Duration::hours(1)), move || {
            let counted = counted.clone();
            Box::pin(async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        // Force the job due, then tick twice: only the due tick runs it.
        scheduler.jobs[0].next_due = Utc::now() - Duration::minutes(1);
        scheduler.tick(Utc::now()).await;
        scheduler.tick(Utc::now()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.jobs[0].next_due > Utc::now());
    }

    #[tokio::test]
    async fn missed_triggers_collapse_into_one_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let counted = counter.clone();
        scheduler.add_job("ingest", Cadence::Every(Duration::hours(1)), move || {
            let counted = counted.clone();
            Box::pin(async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        // Three trigger points passed while a previous job was busy.
        scheduler.jobs[0].next_due = Utc::now() - Duration::hours(3);
        scheduler.tick(Utc::now()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_job_does_not_stop_later_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.add_job("broken", Cadence::Every(Duration::hours(1)), || {
            Box::pin(async { Err(crate::contracts::PipelineError::transient("boom")) })
        });
        let counted = counter.clone();
        scheduler.add_job("healthy", Cadence::Every(Duration::hours(1)), move || {
            let counted = counted.clone();
            Box::pin(async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        scheduler.jobs[0].next_due = Utc::now() - Duration::minutes(5);
        scheduler.jobs[1].next_due = Utc::now() - Duration::minutes(5);
        scheduler.tick(Utc::now()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
