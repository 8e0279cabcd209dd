/// Periodic control loop: applies schedule windows to the persisted
/// active modes, reloads the ports that changed, and sends
/// subscription-expiry reminders in each user's local time.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::db::{Repository, User};
use crate::fabric::ProxyFabric;
use crate::notify::Notifier;
use crate::resolver;

pub struct Scheduler {
    repo: Arc<dyn Repository>,
    fabric: Arc<ProxyFabric>,
    notifier: Arc<dyn Notifier>,
    check_interval: Duration,

    /// Reminder dedup: user id -> (local date, days-left values already
    /// sent that day).
    reminded: Mutex<HashMap<i64, (NaiveDate, HashSet<i64>)>>,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        fabric: Arc<ProxyFabric>,
        notifier: Arc<dyn Notifier>,
        check_interval: Duration,
    ) -> Self {
        Self {
            repo,
            fabric,
            notifier,
            check_interval,
            reminded: Mutex::new(HashMap::new()),
        }
    }

    /// Tick until shutdown. Ticks never overlap; an overrunning tick just
    /// delays the next one.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "scheduler started (interval {}s)",
            self.check_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_schedules(&shutdown).await {
                        error!("schedule check failed: {:#}", e);
                    }
                    if let Err(e) = self.check_subscription_reminders().await {
                        error!("subscription reminder check failed: {:#}", e);
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// One pass over all users: persist schedule-driven mode changes and
    /// reload exactly the ports that changed.
    async fn check_schedules(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        debug!("checking schedules");
        let users = self.repo.list_users().await?;
        let mut dirty_ports = BTreeSet::new();

        for user in &users {
            if *shutdown.borrow() {
                return Ok(());
            }
            if let Err(e) = self.apply_schedule(user, &mut dirty_ports).await {
                error!("schedule check for user {} failed: {:#}", user.id, e);
            }
        }

        for port in dirty_ports {
            if let Err(e) = self.fabric.reload_port(port).await {
                error!("reload of port {} failed: {:#}", port, e);
            }
        }
        Ok(())
    }

    async fn apply_schedule(&self, user: &User, dirty_ports: &mut BTreeSet<u16>) -> Result<()> {
        let effective = match resolver::effective_mode(&self.repo, user).await? {
            Some(mode) => mode,
            None => return Ok(()),
        };
        let active = self.repo.active_mode(user.id).await?;
        if active.as_ref().map(|m| m.id) == Some(effective.id) {
            return Ok(());
        }

        self.repo.set_active_mode(user.id, effective.id).await?;
        dirty_ports.insert(user.port);
        info!(
            "schedule activated mode '{}' (id {}) for user {} on port {}",
            effective.name, effective.id, user.id, user.port
        );
        Ok(())
    }

    /// At most one reminder per (user, days-left in {3,2,1}) per local
    /// calendar day. Notifier failures are logged, never retried.
    async fn check_subscription_reminders(&self) -> Result<()> {
        let users = self.repo.list_users().await?;
        for user in &users {
            let tz: Tz = user.timezone.parse().unwrap_or(chrono_tz::UTC);
            let today = Utc::now().with_timezone(&tz).date_naive();
            let expiry = user.subscription_until.with_timezone(&tz).date_naive();
            let days_left = (expiry - today).num_days();
            if !(1..=3).contains(&days_left) {
                continue;
            }

            {
                let mut reminded = self.reminded.lock().unwrap();
                let entry = reminded
                    .entry(user.id)
                    .or_insert_with(|| (today, HashSet::new()));
                if entry.0 != today {
                    *entry = (today, HashSet::new());
                }
                if !entry.1.insert(days_left) {
                    continue;
                }
            }

            let prefix = match days_left {
                1 => "Ваша подписка заканчивается завтра".to_string(),
                n => format!("Ваша подписка заканчивается через {} дня", n),
            };
            let message = format!(
                "⚠️ Напоминание\n{} (до {}).",
                prefix,
                user.subscription_until
                    .with_timezone(&tz)
                    .format("%d.%m.%Y %H:%M")
            );
            if let Err(e) = self.notifier.notify(user.tg_id, &message).await {
                error!("reminder for user {} failed: {:#}", user.id, e);
            }
        }
        Ok(())
    }
}
