use super::Context;
use anyhow::Result;
use clap::Args;
use coldstash_core::Error;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Backup,
    RemoveOld,
    ListRemote,
    Report,
}

struct Slot {
    task: Task,
    every: Duration,
    next: Instant,
}

/// Fixed-interval timetable. Each task first runs one interval after start.
struct Schedule {
    slots: Vec<Slot>,
}

impl Schedule {
    fn new(intervals: &[(Task, Duration)], now: Instant) -> Self {
        let slots = intervals
            .iter()
            .map(|&(task, every)| Slot {
                task,
                every,
                next: now + every,
            })
            .collect();
        Self { slots }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|slot| slot.next).min()
    }

    /// Tasks due at `now`, in declaration order. A task that fell behind runs
    /// once and is rescheduled from `now`.
    fn take_due(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        for slot in &mut self.slots {
            if slot.next <= now {
                due.push(slot.task);
                slot.next = now + slot.every;
            }
        }
        due
    }
}

#[derive(Args)]
pub struct StartCommand {
    #[arg(long, help = "Run a backup right away instead of waiting one interval")]
    now: bool,
}

fn log_failure(task: &str, err: &Error) {
    error!(task, kind = %err.kind(), error = %err, "Scheduled task failed");
}

impl StartCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let request = ctx.backup_request()?;
        let scheduler = &ctx.config.scheduler;
        let mut schedule = Schedule::new(
            &[
                (Task::Backup, scheduler.backup()),
                (Task::RemoveOld, scheduler.remove_old()),
                (Task::ListRemote, scheduler.list_remote()),
                (Task::Report, scheduler.report()),
            ],
            Instant::now(),
        );

        info!(
            backup = ?scheduler.backup(),
            remove_old = ?scheduler.remove_old(),
            list_remote = ?scheduler.list_remote(),
            "Scheduler started"
        );

        let mut pending = if self.now { vec![Task::Backup] } else { Vec::new() };
        loop {
            for task in pending.drain(..) {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                match task {
                    Task::Backup => {
                        if let Err(e) = ctx.orchestrator.backup(&request).await {
                            log_failure("backup", &e);
                        }
                    }
                    Task::RemoveOld => {
                        if let Err(e) = ctx.orchestrator.remove_old_backups(ctx.config.keep_backups).await {
                            log_failure("remove-old", &e);
                        }
                    }
                    Task::ListRemote => {
                        if let Err(e) = ctx.orchestrator.list_backups(true).await {
                            log_failure("list-remote", &e);
                        }
                    }
                    Task::Report => {
                        for entry in ctx.reports.take() {
                            info!("Report\n{}", entry);
                        }
                    }
                }
            }

            let Some(deadline) = schedule.next_deadline() else {
                break;
            };
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            }
            pending = schedule.take_due(Instant::now());
        }

        info!("Scheduler stopped");
        ctx.print_reports();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_first_run_after_one_interval() {
        let start = Instant::now();
        let mut schedule = Schedule::new(&[(Task::Backup, HOUR), (Task::Report, 3 * HOUR)], start);

        assert_eq!(schedule.next_deadline(), Some(start + HOUR));
        assert!(schedule.take_due(start).is_empty());
        assert_eq!(schedule.take_due(start + HOUR), vec![Task::Backup]);
        assert_eq!(schedule.next_deadline(), Some(start + 2 * HOUR));
    }

    #[test]
    fn test_simultaneous_tasks_run_in_order() {
        let start = Instant::now();
        let mut schedule = Schedule::new(
            &[(Task::Backup, HOUR), (Task::RemoveOld, 2 * HOUR), (Task::ListRemote, 2 * HOUR)],
            start,
        );

        schedule.take_due(start + HOUR);
        assert_eq!(
            schedule.take_due(start + 2 * HOUR),
            vec![Task::Backup, Task::RemoveOld, Task::ListRemote]
        );
    }

    #[test]
    fn test_late_task_runs_once() {
        let start = Instant::now();
        let mut schedule = Schedule::new(&[(Task::Backup, HOUR)], start);

        let late = start + 5 * HOUR;
        assert_eq!(schedule.take_due(late), vec![Task::Backup]);
        assert_eq!(schedule.next_deadline(), Some(late + HOUR));
    }

    #[test]
    fn test_empty_schedule_has_no_deadline() {
        let schedule = Schedule::new(&[], Instant::now());
        assert!(schedule.next_deadline().is_none());
    }
}
