//! SQLite history: every delivered dose and every sensor snapshot a cycle
//! consumed. The in-memory history in `state.rs` is capped; this is the
//! long-term record.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::role::ActuatorRole;
use crate::sensor::SensorSnapshot;
use crate::state::DoseRecord;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/nutrient/nutrient.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // An in-memory database exists per connection.
        let max = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Dose events
    // ----------------------------

    pub async fn insert_dose(&self, d: &DoseRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dose_events (
              ts, role, actuator_id, volume_ml, reason,
              current_value, target_value, product
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(d.ts.unix_timestamp())
        .bind(d.role.to_string())
        .bind(&d.actuator_id)
        .bind(d.volume_ml)
        .bind(&d.reason)
        .bind(d.current_value)
        .bind(d.target_value)
        .bind(d.product.as_deref())
        .execute(&self.pool)
        .await
        .context("insert_dose failed")?;
        Ok(())
    }

    /// Newest `limit` dose events, oldest first.
    pub async fn recent_doses(&self, limit: i64) -> Result<Vec<DoseRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, role, actuator_id, volume_ml, reason,
                   current_value, target_value, product
            FROM (SELECT * FROM dose_events ORDER BY id DESC LIMIT ?)
            ORDER BY id ASC
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_doses failed")?;

        rows.into_iter()
            .map(|r| {
                let role: String = r.try_get("role")?;
                Ok(DoseRecord {
                    ts: from_unix(r.try_get("ts")?)?,
                    role: ActuatorRole::from_str(&role).map_err(anyhow::Error::msg)?,
                    actuator_id: r.try_get("actuator_id")?,
                    volume_ml: r.try_get("volume_ml")?,
                    reason: r.try_get("reason")?,
                    current_value: r.try_get("current_value")?,
                    target_value: r.try_get("target_value")?,
                    product: r.try_get("product")?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    pub async fn insert_reading(&self, s: &SensorSnapshot) -> Result<()> {
        sqlx::query("INSERT INTO sensor_readings (ts, ph, ec, water_temp) VALUES (?, ?, ?, ?)")
            .bind(s.captured_at.unix_timestamp())
            .bind(s.ph)
            .bind(s.ec)
            .bind(s.water_temp)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest `limit` readings, oldest first.
    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<SensorSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, ph, ec, water_temp
            FROM (SELECT * FROM sensor_readings ORDER BY id DESC LIMIT ?)
            ORDER BY id ASC
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;

        rows.into_iter()
            .map(|r| {
                Ok(SensorSnapshot {
                    ph: r.try_get("ph")?,
                    ec: r.try_get("ec")?,
                    water_temp: r.try_get("water_temp")?,
                    captured_at: from_unix(r.try_get("ts")?)?,
                })
            })
            .collect()
    }
}

fn from_unix(ts: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).with_context(|| format!("bad timestamp {ts}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn dose(role: ActuatorRole, volume_ml: f64, ts: OffsetDateTime) -> DoseRecord {
        DoseRecord {
            ts,
            role,
            actuator_id: role.to_string(),
            volume_ml,
            reason: "test".into(),
            current_value: 0.9,
            target_value: 1.4,
            product: None,
        }
    }

    #[tokio::test]
    async fn dose_events_round_trip_newest_last() {
        let db = memory_db().await;
        let t0 = datetime!(2026-03-01 10:00 UTC);
        for i in 0..5 {
            let mut d = dose(ActuatorRole::Nutrient(1), i as f64, t0 + time::Duration::minutes(i));
            d.product = Some("Grow A".into());
            db.insert_dose(&d).await.unwrap();
        }

        let recent = db.recent_doses(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].volume_ml, 3.0);
        assert_eq!(recent[1].volume_ml, 4.0);
        assert_eq!(recent[1].role, ActuatorRole::Nutrient(1));
        assert_eq!(recent[1].product.as_deref(), Some("Grow A"));
        assert_eq!(recent[1].ts, t0 + time::Duration::minutes(4));
    }

    #[tokio::test]
    async fn readings_round_trip() {
        let db = memory_db().await;
        let s = SensorSnapshot {
            ph: 5.9,
            ec: 1.35,
            water_temp: 20.5,
            captured_at: datetime!(2026-03-01 10:00 UTC),
        };
        db.insert_reading(&s).await.unwrap();
        let back = db.recent_readings(10).await.unwrap();
        assert_eq!(back, vec![s]);
    }
}
