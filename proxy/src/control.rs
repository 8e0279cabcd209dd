/// Administrative operations behind the HTTP surfaces. Transport-free:
/// inputs are validated here, outputs are entities or typed errors.
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{error, info};

use crate::config::Config;
use crate::db::{Mode, NewUser, PaymentRequest, PaymentStatus, Repository, Schedule, User, UserRole};
use crate::error::ControlError;
use crate::fabric::ProxyFabric;

type ControlResult<T> = Result<T, ControlError>;

pub struct ControlPlane {
    repo: Arc<dyn Repository>,
    fabric: Arc<ProxyFabric>,
    config: Config,
}

/// Outcome of a port move; reload failures are reported, not rolled back.
#[derive(Debug)]
pub struct PortChange {
    pub old_port: u16,
    pub new_port: u16,
    pub reload_errors: Vec<String>,
}

impl ControlPlane {
    pub fn new(repo: Arc<dyn Repository>, fabric: Arc<ProxyFabric>, config: Config) -> Self {
        Self { repo, fabric, config }
    }

    async fn user_by_tg_id(&self, tg_id: i64) -> ControlResult<User> {
        self.repo
            .find_user_by_tg_id(tg_id)
            .await?
            .ok_or(ControlError::NotFound("user"))
    }

    pub async fn list_users(&self) -> ControlResult<Vec<User>> {
        Ok(self.repo.list_users().await?)
    }

    pub async fn free_ports(&self) -> ControlResult<Vec<u16>> {
        let used = self.repo.used_ports().await?;
        let (lo, hi) = self.config.port_range;
        Ok((lo..=hi).filter(|p| !used.contains(p)).collect())
    }

    pub async fn add_user(
        &self,
        tg_id: i64,
        username: Option<String>,
        port: u16,
        login: &str,
    ) -> ControlResult<User> {
        if !self.config.port_in_range(port) {
            return Err(ControlError::validation("port out of range"));
        }
        if login.is_empty() {
            return Err(ControlError::validation("login must not be empty"));
        }
        if self.repo.find_user_by_tg_id(tg_id).await?.is_some() {
            return Err(ControlError::conflict("tg_id already registered"));
        }
        if self.repo.find_user_by_port(port).await?.is_some() {
            return Err(ControlError::conflict("port busy"));
        }

        let user = self
            .repo
            .create_user(NewUser {
                tg_id,
                username,
                role: UserRole::User,
                port,
                login: login.to_string(),
                timezone: "UTC".to_string(),
                subscription_until: Utc::now() + chrono::Duration::days(30),
            })
            .await?;
        info!("created user {} (tg_id {}) on port {}", user.id, tg_id, port);
        Ok(user)
    }

    pub async fn set_port(&self, tg_id: i64, new_port: u16) -> ControlResult<PortChange> {
        if !self.config.port_in_range(new_port) {
            return Err(ControlError::validation("port out of range"));
        }
        if self.repo.find_user_by_port(new_port).await?.is_some() {
            return Err(ControlError::conflict("port busy"));
        }
        let user = self.user_by_tg_id(tg_id).await?;
        let old_port = user.port;
        self.repo.set_user_port(user.id, new_port).await?;

        let mut reload_errors = Vec::new();
        for port in [old_port, new_port] {
            if let Err(e) = self.fabric.reload_port(port).await {
                error!("reload of port {} after port change failed: {:#}", port, e);
                reload_errors.push(format!("port {}: {:#}", port, e));
            }
        }
        Ok(PortChange { old_port, new_port, reload_errors })
    }

    /// Sets the subscription to end at 23:59:59 of `date` (DD.MM.YYYY) in
    /// the user's local day.
    pub async fn set_subscription(&self, tg_id: i64, date: &str) -> ControlResult<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(date, "%d.%m.%Y")
            .map_err(|_| ControlError::validation("bad date"))?;
        let user = self.user_by_tg_id(tg_id).await?;
        let until = end_of_day_utc(date, user_tz(&user));
        self.repo.set_subscription_until(user.id, until).await?;
        Ok(until)
    }

    /// Extends from max(current end, now) by whole calendar months,
    /// clamping the day-of-month, ending at 23:59:59 local.
    pub async fn extend_subscription(&self, tg_id: i64, months: u32) -> ControlResult<DateTime<Utc>> {
        if months == 0 || months > 36 {
            return Err(ControlError::validation("bad months"));
        }
        let user = self.user_by_tg_id(tg_id).await?;
        let tz = user_tz(&user);
        let base = user.subscription_until.max(Utc::now());
        let local_date = base.with_timezone(&tz).date_naive();
        let until = end_of_day_utc(add_months(local_date, months), tz);
        self.repo.set_subscription_until(user.id, until).await?;
        info!("extended subscription of user {} to {}", user.id, until);
        Ok(until)
    }

    pub async fn set_login(&self, tg_id: i64, login: &str) -> ControlResult<()> {
        if login.is_empty() {
            return Err(ControlError::validation("login must not be empty"));
        }
        let user = self.user_by_tg_id(tg_id).await?;
        Ok(self.repo.set_user_login(user.id, login).await?)
    }

    pub async fn list_modes(&self, tg_id: i64) -> ControlResult<Vec<Mode>> {
        let user = self.user_by_tg_id(tg_id).await?;
        Ok(self.repo.list_modes(user.id).await?)
    }

    pub async fn add_mode(
        &self,
        tg_id: i64,
        name: &str,
        host: &str,
        port: u16,
        alias: &str,
    ) -> ControlResult<Mode> {
        if name.is_empty() || host.is_empty() {
            return Err(ControlError::validation("name and host are required"));
        }
        let user = self.user_by_tg_id(tg_id).await?;
        Ok(self
            .repo
            .add_mode(user.id, name, host, port, alias, false)
            .await?)
    }

    pub async fn activate_mode(&self, tg_id: i64, mode_id: i64) -> ControlResult<()> {
        let user = self.user_by_tg_id(tg_id).await?;
        self.repo
            .find_mode(user.id, mode_id)
            .await?
            .ok_or(ControlError::NotFound("mode"))?;
        self.repo.set_active_mode(user.id, mode_id).await?;
        info!("activated mode {} for user {}", mode_id, user.id);
        if let Err(e) = self.fabric.reload_port(user.port).await {
            error!("reload of port {} after activation failed: {:#}", user.port, e);
        }
        Ok(())
    }

    pub async fn delete_mode(&self, tg_id: i64, mode_id: i64) -> ControlResult<()> {
        let user = self.user_by_tg_id(tg_id).await?;
        if !self.repo.delete_mode(user.id, mode_id).await? {
            return Err(ControlError::NotFound("mode"));
        }
        Ok(())
    }

    pub async fn list_schedules(&self, tg_id: i64) -> ControlResult<Vec<Schedule>> {
        let user = self.user_by_tg_id(tg_id).await?;
        Ok(self.repo.schedules_of(user.id).await?)
    }

    pub async fn add_schedule(
        &self,
        tg_id: i64,
        mode_id: i64,
        start_time: &str,
        end_time: &str,
    ) -> ControlResult<Schedule> {
        if !is_hhmm(start_time) || !is_hhmm(end_time) {
            return Err(ControlError::validation("bad time, expected HH:MM"));
        }
        let user = self.user_by_tg_id(tg_id).await?;
        self.repo
            .find_mode(user.id, mode_id)
            .await?
            .ok_or(ControlError::NotFound("mode"))?;
        Ok(self
            .repo
            .add_schedule(user.id, mode_id, start_time, end_time)
            .await?)
    }

    pub async fn delete_schedule(&self, tg_id: i64, schedule_id: i64) -> ControlResult<()> {
        let user = self.user_by_tg_id(tg_id).await?;
        if !self.repo.delete_schedule(user.id, schedule_id).await? {
            return Err(ControlError::NotFound("schedule"));
        }
        Ok(())
    }

    pub async fn list_payments(&self) -> ControlResult<Vec<PaymentRequest>> {
        Ok(self
            .repo
            .list_payment_requests(PaymentStatus::Pending)
            .await?)
    }

    pub async fn update_payment(&self, id: i64, action: &str) -> ControlResult<()> {
        let status = match action {
            "approve" => PaymentStatus::Approved,
            "reject" => PaymentStatus::Rejected,
            _ => return Err(ControlError::validation("bad action")),
        };
        if !self.repo.update_payment_status(id, status).await? {
            return Err(ControlError::NotFound("request"));
        }
        Ok(())
    }

    pub async fn reload_port(&self, port: u16) -> ControlResult<()> {
        self.fabric
            .reload_port(port)
            .await
            .map_err(ControlError::Internal)
    }
}

fn user_tz(user: &User) -> Tz {
    user.timezone.parse().unwrap_or(chrono_tz::UTC)
}

fn is_hhmm(s: &str) -> bool {
    chrono::NaiveTime::parse_from_str(s, "%H:%M").is_ok()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Calendar-month addition with the day clamped to the target month's
/// length (Jan 31 + 1 month = Feb 28/29).
fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    let zero_based = date.year() * 12 + date.month0() as i32 + months as i32;
    let year = zero_based.div_euclid(12);
    let month = zero_based.rem_euclid(12) as u32 + 1;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(date)
}

fn end_of_day_utc(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    match tz.with_ymd_and_hms(date.year(), date.month(), date.day(), 23, 59, 59) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        chrono::LocalResult::None => {
            let naive = NaiveDateTime::new(
                date,
                chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
            );
            Utc.from_utc_datetime(&naive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryRepository;
    use crate::notify::LogNotifier;
    use crate::db::PaymentMethod;

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            proxy_host: "127.0.0.1".to_string(),
            port_range: (4000, 4200),
            scheduler_check_interval: 60,
            dial_timeout_secs: 1,
            app_api_host: String::new(),
            app_api_port: 0,
            app_api_token: String::new(),
            proxy_api_host: String::new(),
            proxy_api_port: 0,
            proxy_api_token: String::new(),
            log_level: "info".to_string(),
        }
    }

    fn control() -> (ControlPlane, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let repo_dyn: Arc<dyn Repository> = repo.clone();
        let config = test_config();
        let fabric = Arc::new(ProxyFabric::new(
            repo_dyn.clone(),
            Arc::new(LogNotifier),
            &config,
        ));
        (ControlPlane::new(repo_dyn, fabric, config), repo)
    }

    #[tokio::test]
    async fn test_add_user_validations() {
        let (control, _repo) = control();

        let err = control.add_user(1, None, 3999, "login").await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let user = control.add_user(1, None, 4100, "login").await.unwrap();
        assert_eq!(user.port, 4100);

        let err = control.add_user(1, None, 4101, "login").await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
        let err = control.add_user(2, None, 4100, "login").await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));

        let modes = control.list_modes(1).await.unwrap();
        assert_eq!(modes.len(), 1);
        assert!(modes[0].is_active && modes[0].is_sleep());
    }

    #[tokio::test]
    async fn test_free_ports_sorted_and_excludes_used() {
        let (control, _repo) = control();
        control.add_user(1, None, 4000, "a").await.unwrap();
        control.add_user(2, None, 4002, "b").await.unwrap();

        let free = control.free_ports().await.unwrap();
        assert!(!free.contains(&4000));
        assert!(!free.contains(&4002));
        assert!(free.contains(&4001));
        let mut sorted = free.clone();
        sorted.sort_unstable();
        assert_eq!(free, sorted);
    }

    #[tokio::test]
    async fn test_add_then_delete_mode_roundtrip() {
        let (control, _repo) = control();
        control.add_user(1, None, 4100, "login").await.unwrap();

        let before = control.list_modes(1).await.unwrap();
        let mode = control
            .add_mode(1, "day", "pool.example.com", 3333, "acct")
            .await
            .unwrap();
        control.delete_mode(1, mode.id).await.unwrap();
        let after = control.list_modes(1).await.unwrap();
        assert_eq!(
            before.iter().map(|m| m.id).collect::<Vec<_>>(),
            after.iter().map(|m| m.id).collect::<Vec<_>>()
        );

        let err = control.delete_mode(1, mode.id).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_schedule_requires_own_mode_and_valid_times() {
        let (control, _repo) = control();
        control.add_user(1, None, 4100, "a").await.unwrap();
        control.add_user(2, None, 4101, "b").await.unwrap();
        let foreign = control
            .add_mode(2, "other", "pool.example.com", 3333, "x")
            .await
            .unwrap();

        let err = control
            .add_schedule(1, foreign.id, "09:00", "10:00")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));

        let own = control
            .add_mode(1, "day", "pool.example.com", 3333, "x")
            .await
            .unwrap();
        let err = control
            .add_schedule(1, own.id, "9 am", "10:00")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let s = control.add_schedule(1, own.id, "09:00", "10:00").await.unwrap();
        control.delete_schedule(1, s.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_subscription_clamps_day_of_month() {
        // Jan 31 + 1 month ends on the last day of February.
        assert_eq!(
            add_months(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(), 1),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
        assert_eq!(
            add_months(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(), 1),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        // December wraps the year
        assert_eq!(
            add_months(NaiveDate::from_ymd_opt(2025, 12, 15).unwrap(), 2),
            NaiveDate::from_ymd_opt(2026, 2, 15).unwrap()
        );

        let (control, _repo) = control();
        control.add_user(1, None, 4100, "a").await.unwrap();
        let until = control.extend_subscription(1, 1).await.unwrap();
        // base is now + 30 days; one month later must be in the future
        assert!(until > Utc::now() + chrono::Duration::days(45));

        let err = control.extend_subscription(1, 0).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn test_set_subscription_parses_russian_date_format() {
        let (control, _repo) = control();
        control.add_user(1, None, 4100, "a").await.unwrap();

        let until = control.set_subscription(1, "31.12.2030").await.unwrap();
        assert_eq!(until.with_timezone(&chrono_tz::UTC).date_naive(),
                   NaiveDate::from_ymd_opt(2030, 12, 31).unwrap());

        let err = control.set_subscription(1, "2030-12-31").await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn test_payment_updates() {
        let (control, repo) = control();
        control.add_user(1, None, 4100, "a").await.unwrap();
        let id = repo.insert_payment(1, PaymentMethod::Trc20, "file-1").await;

        assert_eq!(control.list_payments().await.unwrap().len(), 1);
        control.update_payment(id, "approve").await.unwrap();
        assert!(control.list_payments().await.unwrap().is_empty());

        let err = control.update_payment(id, "frobnicate").await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        let err = control.update_payment(9999, "reject").await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }
}
