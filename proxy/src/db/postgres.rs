/// PostgreSQL repository (tokio-postgres).
///
/// One connection, driven by a background task; the client multiplexes
/// queries over it. Schema is created on startup when missing.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::error;

use super::entities::{
    worker_suffix, Device, Mode, PaymentMethod, PaymentRequest, PaymentStatus, Schedule, User,
    UserRole,
};
use super::{NewUser, Repository};

pub struct PgRepository {
    client: Client,
}

impl PgRepository {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(db_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self { client })
    }

    pub async fn init_schema(&self) -> Result<()> {
        self.client
            .batch_execute(
                r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                tg_id BIGINT NOT NULL UNIQUE,
                username TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                port INTEGER NOT NULL UNIQUE,
                login TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                subscription_until TIMESTAMP WITH TIME ZONE NOT NULL
            );

            CREATE TABLE IF NOT EXISTS modes (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                alias TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT FALSE
            );

            CREATE INDEX IF NOT EXISTS idx_modes_user ON modes(user_id);

            CREATE TABLE IF NOT EXISTS schedules (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                mode_id BIGINT NOT NULL REFERENCES modes(id) ON DELETE CASCADE,
                start_time VARCHAR(5) NOT NULL,
                end_time VARCHAR(5) NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_user ON schedules(user_id);

            CREATE TABLE IF NOT EXISTS devices (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                worker TEXT NOT NULL,
                suffix BIGINT,
                name TEXT NOT NULL,
                last_connected_at TIMESTAMP WITH TIME ZONE NOT NULL,
                last_seen_at TIMESTAMP WITH TIME ZONE NOT NULL,
                is_online BOOLEAN NOT NULL DEFAULT FALSE,
                UNIQUE(user_id, worker)
            );

            CREATE TABLE IF NOT EXISTS payment_requests (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                method TEXT NOT NULL,
                file_id TEXT NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                status TEXT NOT NULL DEFAULT 'pending'
            );

            CREATE INDEX IF NOT EXISTS idx_payment_requests_status
            ON payment_requests(status, created_at);
        "#,
            )
            .await?;

        Ok(())
    }
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get(0),
        tg_id: row.get(1),
        username: row.get(2),
        role: UserRole::from_str(row.get(3)),
        port: row.get::<_, i32>(4) as u16,
        login: row.get(5),
        timezone: row.get(6),
        subscription_until: row.get(7),
    }
}

fn mode_from_row(row: &Row) -> Mode {
    Mode {
        id: row.get(0),
        user_id: row.get(1),
        name: row.get(2),
        host: row.get(3),
        port: row.get::<_, i32>(4) as u16,
        alias: row.get(5),
        is_active: row.get(6),
    }
}

fn schedule_from_row(row: &Row) -> Schedule {
    Schedule {
        id: row.get(0),
        user_id: row.get(1),
        mode_id: row.get(2),
        start_time: row.get(3),
        end_time: row.get(4),
    }
}

fn device_from_row(row: &Row) -> Device {
    Device {
        id: row.get(0),
        user_id: row.get(1),
        worker: row.get(2),
        suffix: row.get(3),
        name: row.get(4),
        last_connected_at: row.get(5),
        last_seen_at: row.get(6),
        is_online: row.get(7),
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn find_user_by_port(&self, port: u16) -> Result<Option<User>> {
        let rows = self
            .client
            .query(
                "SELECT id, tg_id, username, role, port, login, timezone, subscription_until FROM users WHERE port = $1",
                &[&(port as i32)],
            )
            .await?;
        Ok(rows.first().map(user_from_row))
    }

    async fn find_user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>> {
        let rows = self
            .client
            .query(
                "SELECT id, tg_id, username, role, port, login, timezone, subscription_until FROM users WHERE tg_id = $1",
                &[&tg_id],
            )
            .await?;
        Ok(rows.first().map(user_from_row))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = self
            .client
            .query(
                "SELECT id, tg_id, username, role, port, login, timezone, subscription_until FROM users ORDER BY id",
                &[],
            )
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    async fn create_user(&self, new: NewUser) -> Result<User> {
        // Single statement so the user and its Sleep mode appear together.
        self.client
            .execute(
                r#"
            WITH new_user AS (
                INSERT INTO users (tg_id, username, role, port, login, timezone, subscription_until)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
            )
            INSERT INTO modes (user_id, name, host, port, alias, is_active)
            SELECT id, 'Sleep', 'sleep', 0, '', TRUE FROM new_user
            "#,
                &[
                    &new.tg_id,
                    &new.username,
                    &new.role.as_str(),
                    &(new.port as i32),
                    &new.login,
                    &new.timezone,
                    &new.subscription_until,
                ],
            )
            .await?;

        self.find_user_by_tg_id(new.tg_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} vanished after insert", new.tg_id))
    }

    async fn set_user_port(&self, user_id: i64, port: u16) -> Result<()> {
        self.client
            .execute(
                "UPDATE users SET port = $2 WHERE id = $1",
                &[&user_id, &(port as i32)],
            )
            .await?;
        Ok(())
    }

    async fn set_user_login(&self, user_id: i64, login: &str) -> Result<()> {
        self.client
            .execute(
                "UPDATE users SET login = $2 WHERE id = $1",
                &[&user_id, &login],
            )
            .await?;
        Ok(())
    }

    async fn set_subscription_until(&self, user_id: i64, until: DateTime<Utc>) -> Result<()> {
        self.client
            .execute(
                "UPDATE users SET subscription_until = $2 WHERE id = $1",
                &[&user_id, &until],
            )
            .await?;
        Ok(())
    }

    async fn active_mode(&self, user_id: i64) -> Result<Option<Mode>> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, name, host, port, alias, is_active FROM modes WHERE user_id = $1 AND is_active",
                &[&user_id],
            )
            .await?;
        Ok(rows.first().map(mode_from_row))
    }

    async fn list_modes(&self, user_id: i64) -> Result<Vec<Mode>> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, name, host, port, alias, is_active FROM modes WHERE user_id = $1 ORDER BY id",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(mode_from_row).collect())
    }

    async fn find_mode(&self, user_id: i64, mode_id: i64) -> Result<Option<Mode>> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, name, host, port, alias, is_active FROM modes WHERE id = $2 AND user_id = $1",
                &[&user_id, &mode_id],
            )
            .await?;
        Ok(rows.first().map(mode_from_row))
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
        if is_active {
            self.client
                .execute(
                    "UPDATE modes SET is_active = FALSE WHERE user_id = $1",
                    &[&user_id],
                )
                .await?;
        }
        let rows = self
            .client
            .query(
                r#"
            INSERT INTO modes (user_id, name, host, port, alias, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_id, name, host, port, alias, is_active
            "#,
                &[&user_id, &name, &host, &(port as i32), &alias, &is_active],
            )
            .await?;
        Ok(mode_from_row(&rows[0]))
    }

    async fn delete_mode(&self, user_id: i64, mode_id: i64) -> Result<bool> {
        let n = self
            .client
            .execute(
                "DELETE FROM modes WHERE id = $2 AND user_id = $1",
                &[&user_id, &mode_id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn set_active_mode(&self, user_id: i64, mode_id: i64) -> Result<()> {
        // One UPDATE flips the whole set atomically; readers never see
        // two active modes.
        let n = self
            .client
            .execute(
                "UPDATE modes SET is_active = (id = $2) WHERE user_id = $1",
                &[&user_id, &mode_id],
            )
            .await?;
        if n == 0 {
            anyhow::bail!("mode {} not found for user {}", mode_id, user_id);
        }
        Ok(())
    }

    async fn schedules_of(&self, user_id: i64) -> Result<Vec<Schedule>> {
        let rows = self
            .client
            .query(
                r#"
            SELECT id, user_id, mode_id, start_time, end_time
            FROM schedules
            WHERE user_id = $1
            ORDER BY id
            "#,
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(schedule_from_row).collect())
    }

    async fn add_schedule(
        &self,
        user_id: i64,
        mode_id: i64,
        start_time: &str,
        end_time: &str,
    ) -> Result<Schedule> {
        let rows = self
            .client
            .query(
                r#"
            INSERT INTO schedules (user_id, mode_id, start_time, end_time)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, mode_id, start_time, end_time
            "#,
                &[&user_id, &mode_id, &start_time, &end_time],
            )
            .await?;
        Ok(schedule_from_row(&rows[0]))
    }

    async fn delete_schedule(&self, user_id: i64, schedule_id: i64) -> Result<bool> {
        let n = self
            .client
            .execute(
                "DELETE FROM schedules WHERE id = $2 AND user_id = $1",
                &[&user_id, &schedule_id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn upsert_device(&self, user_id: i64, worker: &str, now: DateTime<Utc>) -> Result<()> {
        self.client
            .execute(
                r#"
            INSERT INTO devices
                (user_id, worker, suffix, name, last_connected_at, last_seen_at, is_online)
            VALUES ($1, $2, $3, $2, $4, $4, TRUE)
            ON CONFLICT (user_id, worker) DO UPDATE
            SET
                last_connected_at = EXCLUDED.last_connected_at,
                last_seen_at = EXCLUDED.last_seen_at,
                is_online = TRUE
            "#,
                &[&user_id, &worker, &worker_suffix(worker), &now],
            )
            .await?;
        Ok(())
    }

    async fn mark_device_offline(
        &self,
        user_id: i64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.client
            .execute(
                r#"
            UPDATE devices
            SET is_online = FALSE, last_seen_at = $3
            WHERE user_id = $1 AND worker = $2
            "#,
                &[&user_id, &worker, &now],
            )
            .await?;
        Ok(())
    }

    async fn find_device(&self, user_id: i64, worker: &str) -> Result<Option<Device>> {
        let rows = self
            .client
            .query(
                r#"
            SELECT id, user_id, worker, suffix, name,
                   last_connected_at, last_seen_at, is_online
            FROM devices
            WHERE user_id = $1 AND worker = $2
            "#,
                &[&user_id, &worker],
            )
            .await?;
        Ok(rows.first().map(device_from_row))
    }

    async fn used_ports(&self) -> Result<Vec<u16>> {
        let rows = self
            .client
            .query("SELECT port FROM users ORDER BY port", &[])
            .await?;
        Ok(rows.iter().map(|r| r.get::<_, i32>(0) as u16).collect())
    }

    async fn list_payment_requests(&self, status: PaymentStatus) -> Result<Vec<PaymentRequest>> {
        let rows = self
            .client
            .query(
                r#"
            SELECT id, user_id, method, file_id, created_at, status
            FROM payment_requests
            WHERE status = $1
            ORDER BY created_at
            "#,
                &[&status.as_str()],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PaymentRequest {
                id: row.get(0),
                user_id: row.get(1),
                method: PaymentMethod::parse(row.get(2)).unwrap_or(PaymentMethod::Card),
                file_id: row.get(3),
                created_at: row.get(4),
                status: PaymentStatus::from_str(row.get(5)),
            })
            .collect())
    }

    async fn update_payment_status(&self, id: i64, status: PaymentStatus) -> Result<bool> {
        let n = self
            .client
            .execute(
                "UPDATE payment_requests SET status = $2 WHERE id = $1",
                &[&id, &status.as_str()],
            )
            .await?;
        Ok(n > 0)
    }
}
