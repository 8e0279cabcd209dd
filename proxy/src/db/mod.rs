pub mod entities;
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use entities::{
    Device, Mode, PaymentMethod, PaymentRequest, PaymentStatus, Schedule, User, UserRole,
};

/// Fields for a new user; the repository assigns the id and creates the
/// mandatory active Sleep mode in the same operation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub tg_id: i64,
    pub username: Option<String>,
    pub role: UserRole,
    pub port: u16,
    pub login: String,
    pub timezone: String,
    pub subscription_until: DateTime<Utc>,
}

/// Storage seam for the proxy core. Every call is one short-lived operation;
/// no session is held across awaits outside the implementation.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_user_by_port(&self, port: u16) -> Result<Option<User>>;
    async fn find_user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;

    /// Creates the user together with its active Sleep mode.
    async fn create_user(&self, new: NewUser) -> Result<User>;
    async fn set_user_port(&self, user_id: i64, port: u16) -> Result<()>;
    async fn set_user_login(&self, user_id: i64, login: &str) -> Result<()>;
    async fn set_subscription_until(&self, user_id: i64, until: DateTime<Utc>) -> Result<()>;

    async fn active_mode(&self, user_id: i64) -> Result<Option<Mode>>;
    async fn list_modes(&self, user_id: i64) -> Result<Vec<Mode>>;
    async fn find_mode(&self, user_id: i64, mode_id: i64) -> Result<Option<Mode>>;
    async fn add_mode(
        &self,
        user_id: i64,
        name: &str,
        host: &str,
        port: u16,
        alias: &str,
        is_active: bool,
    ) -> Result<Mode>;
    async fn delete_mode(&self, user_id: i64, mode_id: i64) -> Result<bool>;

    /// Clears every other active flag of the user and sets this one, as one
    /// atomic step. Readers observe either the old or the new active mode.
    async fn set_active_mode(&self, user_id: i64, mode_id: i64) -> Result<()>;

    async fn schedules_of(&self, user_id: i64) -> Result<Vec<Schedule>>;
    async fn add_schedule(
        &self,
        user_id: i64,
        mode_id: i64,
        start_time: &str,
        end_time: &str,
    ) -> Result<Schedule>;
    async fn delete_schedule(&self, user_id: i64, schedule_id: i64) -> Result<bool>;

    async fn upsert_device(&self, user_id: i64, worker: &str, now: DateTime<Utc>) -> Result<()>;
    async fn mark_device_offline(
        &self,
        user_id: i64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn find_device(&self, user_id: i64, worker: &str) -> Result<Option<Device>>;

    async fn used_ports(&self) -> Result<Vec<u16>>;

    async fn list_payment_requests(&self, status: PaymentStatus) -> Result<Vec<PaymentRequest>>;
    async fn update_payment_status(&self, id: i64, status: PaymentStatus) -> Result<bool>;
}
