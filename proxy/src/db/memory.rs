/// In-memory repository.
///
/// Backs the test suite and single-node setups without PostgreSQL. All
/// state lives in one RwLock'd table set; every trait call takes the lock
/// once, so writers never expose a half-applied state.
use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::entities::{
    worker_suffix, Device, Mode, PaymentRequest, PaymentStatus, Schedule, User,
};
use super::{NewUser, Repository};

#[derive(Default)]
struct Tables {
    users: HashMap<i64, User>,
    modes: HashMap<i64, Mode>,
    schedules: HashMap<i64, Schedule>,
    devices: HashMap<i64, Device>,
    payments: HashMap<i64, PaymentRequest>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a pending payment request.
    pub async fn insert_payment(&self, user_id: i64, method: super::PaymentMethod, file_id: &str) -> i64 {
        let mut t = self.tables.write().await;
        let id = t.next_id();
        t.payments.insert(
            id,
            PaymentRequest {
                id,
                user_id,
                method,
                file_id: file_id.to_string(),
                created_at: Utc::now(),
                status: PaymentStatus::Pending,
            },
        );
        id
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_user_by_port(&self, port: u16) -> Result<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users.values().find(|u| u.port == port).cloned())
    }

    async fn find_user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users.values().find(|u| u.tg_id == tg_id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let t = self.tables.read().await;
        let mut users: Vec<User> = t.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn create_user(&self, new: NewUser) -> Result<User> {
        let mut t = self.tables.write().await;
        if t.users.values().any(|u| u.tg_id == new.tg_id) {
            bail!("tg_id {} already exists", new.tg_id);
        }
        if t.users.values().any(|u| u.port == new.port) {
            bail!("port {} already in use", new.port);
        }
        let id = t.next_id();
        let user = User {
            id,
            tg_id: new.tg_id,
            username: new.username,
            role: new.role,
            port: new.port,
            login: new.login,
            timezone: new.timezone,
            subscription_until: new.subscription_until,
        };
        t.users.insert(id, user.clone());
        let mode_id = t.next_id();
        t.modes.insert(
            mode_id,
            Mode {
                id: mode_id,
                user_id: id,
                name: "Sleep".to_string(),
                host: super::entities::SLEEP_HOST.to_string(),
                port: 0,
                alias: String::new(),
                is_active: true,
            },
        );
        Ok(user)
    }

    async fn set_user_port(&self, user_id: i64, port: u16) -> Result<()> {
        let mut t = self.tables.write().await;
        if t.users.values().any(|u| u.port == port && u.id != user_id) {
            bail!("port {} already in use", port);
        }
        match t.users.get_mut(&user_id) {
            Some(u) => {
                u.port = port;
                Ok(())
            }
            None => bail!("user {} not found", user_id),
        }
    }

    async fn set_user_login(&self, user_id: i64, login: &str) -> Result<()> {
        let mut t = self.tables.write().await;
        match t.users.get_mut(&user_id) {
            Some(u) => {
                u.login = login.to_string();
                Ok(())
            }
            None => bail!("user {} not found", user_id),
        }
    }

    async fn set_subscription_until(&self, user_id: i64, until: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.write().await;
        match t.users.get_mut(&user_id) {
            Some(u) => {
                u.subscription_until = until;
                Ok(())
            }
            None => bail!("user {} not found", user_id),
        }
    }

    async fn active_mode(&self, user_id: i64) -> Result<Option<Mode>> {
        let t = self.tables.read().await;
        Ok(t.modes
            .values()
            .find(|m| m.user_id == user_id && m.is_active)
            .cloned())
    }

    async fn list_modes(&self, user_id: i64) -> Result<Vec<Mode>> {
        let t = self.tables.read().await;
        let mut modes: Vec<Mode> = t
            .modes
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        modes.sort_by_key(|m| m.id);
        Ok(modes)
    }

    async fn find_mode(&self, user_id: i64, mode_id: i64) -> Result<Option<Mode>> {
        let t = self.tables.read().await;
        Ok(t.modes
            .get(&mode_id)
            .filter(|m| m.user_id == user_id)
            .cloned())
    }

    async fn add_mode(
        &self,
        user_id: i64,
        name: &str,
        host: &str,
        port: u16,
        alias: &str,
        is_active: bool,
    ) -> Result<Mode> {
        let mut t = self.tables.write().await;
        if is_active {
            for m in t.modes.values_mut().filter(|m| m.user_id == user_id) {
                m.is_active = false;
            }
        }
        let id = t.next_id();
        let mode = Mode {
            id,
            user_id,
            name: name.to_string(),
            host: host.to_string(),
            port,
            alias: alias.to_string(),
            is_active,
        };
        t.modes.insert(id, mode.clone());
        Ok(mode)
    }

    async fn delete_mode(&self, user_id: i64, mode_id: i64) -> Result<bool> {
        let mut t = self.tables.write().await;
        let existed = t
            .modes
            .get(&mode_id)
            .map(|m| m.user_id == user_id)
            .unwrap_or(false);
        if existed {
            t.modes.remove(&mode_id);
            t.schedules.retain(|_, s| s.mode_id != mode_id);
        }
        Ok(existed)
    }

    async fn set_active_mode(&self, user_id: i64, mode_id: i64) -> Result<()> {
        let mut t = self.tables.write().await;
        if !t
            .modes
            .get(&mode_id)
            .map(|m| m.user_id == user_id)
            .unwrap_or(false)
        {
            bail!("mode {} not found for user {}", mode_id, user_id);
        }
        for m in t.modes.values_mut().filter(|m| m.user_id == user_id) {
            m.is_active = m.id == mode_id;
        }
        Ok(())
    }

    async fn schedules_of(&self, user_id: i64) -> Result<Vec<Schedule>> {
        let t = self.tables.read().await;
        let mut schedules: Vec<Schedule> = t
            .schedules
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn add_schedule(
        &self,
        user_id: i64,
        mode_id: i64,
        start_time: &str,
        end_time: &str,
    ) -> Result<Schedule> {
        let mut t = self.tables.write().await;
        let id = t.next_id();
        let schedule = Schedule {
            id,
            user_id,
            mode_id,
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
        };
        t.schedules.insert(id, schedule.clone());
        Ok(schedule)
    }

    async fn delete_schedule(&self, user_id: i64, schedule_id: i64) -> Result<bool> {
        let mut t = self.tables.write().await;
        let existed = t
            .schedules
            .get(&schedule_id)
            .map(|s| s.user_id == user_id)
            .unwrap_or(false);
        if existed {
            t.schedules.remove(&schedule_id);
        }
        Ok(existed)
    }

    async fn upsert_device(&self, user_id: i64, worker: &str, now: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.write().await;
        if let Some(d) = t
            .devices
            .values_mut()
            .find(|d| d.user_id == user_id && d.worker == worker)
        {
            d.last_connected_at = now;
            d.last_seen_at = now;
            d.is_online = true;
            return Ok(());
        }
        let id = t.next_id();
        t.devices.insert(
            id,
            Device {
                id,
                user_id,
                worker: worker.to_string(),
                suffix: worker_suffix(worker),
                name: worker.to_string(),
                last_connected_at: now,
                last_seen_at: now,
                is_online: true,
            },
        );
        Ok(())
    }

    async fn mark_device_offline(
        &self,
        user_id: i64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.write().await;
        if let Some(d) = t
            .devices
            .values_mut()
            .find(|d| d.user_id == user_id && d.worker == worker)
        {
            d.is_online = false;
            d.last_seen_at = now;
        }
        Ok(())
    }

    async fn find_device(&self, user_id: i64, worker: &str) -> Result<Option<Device>> {
        let t = self.tables.read().await;
        Ok(t.devices
            .values()
            .find(|d| d.user_id == user_id && d.worker == worker)
            .cloned())
    }

    async fn used_ports(&self) -> Result<Vec<u16>> {
        let t = self.tables.read().await;
        let mut ports: Vec<u16> = t.users.values().map(|u| u.port).collect();
        ports.sort_unstable();
        Ok(ports)
    }

    async fn list_payment_requests(&self, status: PaymentStatus) -> Result<Vec<PaymentRequest>> {
        let t = self.tables.read().await;
        let mut requests: Vec<PaymentRequest> = t
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        requests.sort_by_key(|p| p.created_at);
        Ok(requests)
    }

    async fn update_payment_status(&self, id: i64, status: PaymentStatus) -> Result<bool> {
        let mut t = self.tables.write().await;
        match t.payments.get_mut(&id) {
            Some(p) => {
                p.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
