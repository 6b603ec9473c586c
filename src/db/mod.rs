use std::{path::Path, str};

use anyhow::Result;
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    entitlement::{ContentCatalog, SubscriptionLedger},
    error::{CheckError, CheckResult},
    model::{
        course::Course, preferences::Preferences, subscription::Subscription, user::User,
        user_device::UserDevice,
    },
    session::DeviceSessions,
};

pub struct DBLayer {
    db: DB,
    /// Serializes read-modify-write of device bindings.
    bindings: Mutex<()>,
    /// Serializes account writes so the email index stays unique.
    accounts: Mutex<()>,
}

impl DBLayer {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            bindings: Mutex::new(()),
            accounts: Mutex::new(()),
        })
    }

    // ============================================================
    // KEYS
    // ============================================================
    fn user_key(user_id: &str) -> String {
        format!("user:{user_id}")
    }

    fn email_lookup_key(email: &str) -> String {
        format!("user_email:{email}")
    }

    fn user_device_prefix(user_id: &str) -> String {
        format!("user_device:{user_id}:")
    }

    fn user_device_key(user_id: &str, device_id: &str) -> String {
        format!("{}{device_id}", Self::user_device_prefix(user_id))
    }

    fn course_key(course_id: &str) -> String {
        format!("course:{course_id}")
    }

    fn subscription_prefix(user_id: &str) -> String {
        format!("subscription:{user_id}:")
    }

    fn subscription_key(user_id: &str, sub_id: &str) -> String {
        format!("{}{sub_id}", Self::subscription_prefix(user_id))
    }

    fn preferences_key(user_id: &str) -> String {
        format!("prefs:{user_id}")
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let val = serde_json::to_vec(value)?;
        self.db.put(key, val)?;
        Ok(())
    }

    fn batch_json<T: Serialize>(batch: &mut WriteBatch, key: &str, value: &T) -> Result<()> {
        batch.put(key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.db
            .get(key)?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, val) = item?;
            let k = str::from_utf8(&key)?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push(serde_json::from_slice(&val)?);
        }
        Ok(out)
    }

    // ============================================================
    // USER STORAGE
    // ============================================================
    fn write_user(&self, user: &User) -> Result<()> {
        let mut batch = WriteBatch::default();
        Self::batch_json(&mut batch, &Self::user_key(&user.id), user)?;
        batch.put(Self::email_lookup_key(&user.email), user.id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Stores a new user unless the email is already taken, in which case
    /// nothing is written and `false` is returned.
    pub async fn create_user(&self, user: &User) -> Result<bool> {
        let _guard = self.accounts.lock().await;
        if self.db.get(Self::email_lookup_key(&user.email))?.is_some() {
            return Ok(false);
        }
        self.write_user(user)?;
        Ok(true)
    }

    pub async fn save_user(&self, user: &User) -> Result<()> {
        let _guard = self.accounts.lock().await;
        self.write_user(user)
    }

    pub async fn load_user(&self, id: &str) -> Result<Option<User>> {
        self.get_json(&Self::user_key(id))
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let Some(raw_id) = self.db.get(Self::email_lookup_key(email))? else {
            return Ok(None);
        };
        let id = str::from_utf8(&raw_id)?;
        self.load_user(id).await
    }

    // ============================================================
    // DEVICE BINDINGS
    // ============================================================
    pub async fn list_devices_for_user(&self, user_id: &str) -> Result<Vec<UserDevice>> {
        self.scan_prefix(&Self::user_device_prefix(user_id))
    }

    /// Makes `device_hash` the only active device of the user. The
    /// deactivations and the activated row land in one write batch.
    pub async fn bind_device(&self, user_id: &str, device_hash: &str) -> Result<UserDevice> {
        let _guard = self.bindings.lock().await;
        let now = chrono::Utc::now().timestamp();
        let mut batch = WriteBatch::default();
        let mut bound = None;
        let mut superseded = Vec::new();

        for mut device in self.list_devices_for_user(user_id).await? {
            let key = Self::user_device_key(user_id, &device.id);
            if device.device_hash == device_hash && bound.is_none() {
                device.is_active = true;
                device.last_active_ts = now;
                Self::batch_json(&mut batch, &key, &device)?;
                bound = Some(device);
            } else if device.is_active {
                device.is_active = false;
                Self::batch_json(&mut batch, &key, &device)?;
                superseded.push(device.id);
            }
        }

        let device = match bound {
            Some(device) => device,
            None => {
                let device = UserDevice {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    device_hash: device_hash.to_string(),
                    is_active: true,
                    created_ts: now,
                    last_active_ts: now,
                };
                Self::batch_json(
                    &mut batch,
                    &Self::user_device_key(user_id, &device.id),
                    &device,
                )?;
                device
            }
        };

        self.db.write(batch)?;
        for device_id in superseded {
            info!(user_id, device_id = %device_id, "device binding superseded");
        }
        Ok(device)
    }

    /// Deactivates every binding of the user matching `device_hash`.
    pub async fn release_device(&self, user_id: &str, device_hash: &str) -> Result<bool> {
        let _guard = self.bindings.lock().await;
        let mut batch = WriteBatch::default();
        let mut released = false;
        for mut device in self.list_devices_for_user(user_id).await? {
            if device.device_hash == device_hash && device.is_active {
                device.is_active = false;
                Self::batch_json(
                    &mut batch,
                    &Self::user_device_key(user_id, &device.id),
                    &device,
                )?;
                released = true;
            }
        }
        self.db.write(batch)?;
        Ok(released)
    }

    pub async fn revoke_device(&self, user_id: &str, device_id: &str) -> Result<bool> {
        let _guard = self.bindings.lock().await;
        let key = Self::user_device_key(user_id, device_id);
        let Some(mut device) = self.get_json::<UserDevice>(&key)? else {
            return Ok(false);
        };
        device.is_active = false;
        self.put_json(&key, &device)?;
        Ok(true)
    }

    // ============================================================
    // COURSES
    // ============================================================
    pub async fn save_course(&self, course: &Course) -> Result<()> {
        self.put_json(&Self::course_key(&course.id), course)
    }

    pub async fn load_course(&self, id: &str) -> Result<Option<Course>> {
        self.get_json(&Self::course_key(id))
    }

    pub async fn list_courses(&self) -> Result<Vec<Course>> {
        self.scan_prefix("course:")
    }

    // ============================================================
    // SUBSCRIPTIONS
    // ============================================================
    pub async fn save_subscription(&self, sub: &Subscription) -> Result<()> {
        self.put_json(&Self::subscription_key(&sub.user_id, &sub.id), sub)
    }

    pub async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        self.scan_prefix(&Self::subscription_prefix(user_id))
    }

    // ============================================================
    // PREFERENCES
    // ============================================================
    pub async fn load_preferences(&self, user_id: &str) -> Result<Preferences> {
        Ok(self
            .get_json(&Self::preferences_key(user_id))?
            .unwrap_or_default())
    }

    pub async fn save_preferences(&self, user_id: &str, prefs: &Preferences) -> Result<()> {
        self.put_json(&Self::preferences_key(user_id), prefs)
    }
}

#[async_trait]
impl DeviceSessions for DBLayer {
    async fn is_device_valid(&self, user_id: &str, device_hash: &str) -> CheckResult<bool> {
        let devices = self
            .list_devices_for_user(user_id)
            .await
            .map_err(CheckError::from)?;
        Ok(devices.iter().any(|d| d.matches(device_hash)))
    }
}

#[async_trait]
impl ContentCatalog for DBLayer {
    async fn course_is_free(&self, course_id: &str) -> CheckResult<Option<bool>> {
        let course = self.load_course(course_id).await?;
        Ok(course.map(|c| c.is_free))
    }
}

#[async_trait]
impl SubscriptionLedger for DBLayer {
    async fn subscriptions_for(&self, user_id: &str) -> CheckResult<Vec<Subscription>> {
        Ok(self.list_subscriptions_for_user(user_id).await?)
    }
}
