//! 内線番号 → バインディングを管理するレジストラ。
//! 期限切れのバインディングは読み出し時と定期クリーンアップの両方で除去する。

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

const HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ContactBinding {
    pub extension: String,
    pub contact_uri: String,
    pub transport: SocketAddr,
    pub expires_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub registration_count: u64,
}

impl ContactBinding {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationEvent {
    Register,
    Unregister,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRecord {
    pub id: String,
    pub event: RegistrationEvent,
    pub extension: String,
    pub contact_uri: Option<String>,
    pub transport: Option<SocketAddr>,
    pub at: DateTime<Utc>,
}

impl RegistrationRecord {
    fn new(
        event: RegistrationEvent,
        extension: &str,
        contact_uri: Option<String>,
        transport: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event,
            extension: extension.to_string(),
            contact_uri,
            transport,
            at: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct UserRegistry {
    bindings: Mutex<HashMap<String, ContactBinding>>,
    history: Mutex<VecDeque<RegistrationRecord>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// バインディングの新規作成または更新。既存があれば registered_at と
    /// 登録回数を引き継ぐ。
    pub fn register(
        &self,
        number: &str,
        contact_uri: &str,
        transport: SocketAddr,
        expires_seconds: u64,
    ) -> ContactBinding {
        let now = Utc::now();
        let binding = {
            let mut map = self.bindings.lock().unwrap();
            let prior = map.get(number);
            let (registered_at, registration_count) = match prior {
                Some(b) => (b.registered_at, b.registration_count + 1),
                None => (now, 1),
            };
            let binding = ContactBinding {
                extension: number.to_string(),
                contact_uri: contact_uri.to_string(),
                transport,
                expires_seconds,
                expires_at: now + Duration::seconds(expires_seconds as i64),
                registered_at,
                last_seen: now,
                registration_count,
            };
            map.insert(number.to_string(), binding.clone());
            binding
        };

        self.push_history(RegistrationRecord::new(
            RegistrationEvent::Register,
            number,
            Some(contact_uri.to_string()),
            Some(transport),
        ));
        binding
    }

    pub fn unregister(&self, number: &str) -> bool {
        let removed = self.bindings.lock().unwrap().remove(number).is_some();
        if removed {
            self.push_history(RegistrationRecord::new(
                RegistrationEvent::Unregister,
                number,
                None,
                None,
            ));
        }
        removed
    }

    /// 期限内のバインディングだけを返す。期限切れはここで除去する。
    pub fn lookup(&self, number: &str) -> Option<ContactBinding> {
        let now = Utc::now();
        let mut map = self.bindings.lock().unwrap();
        match map.get(number) {
            Some(b) if !b.is_expired(now) => Some(b.clone()),
            Some(_) => {
                map.remove(number);
                None
            }
            None => None,
        }
    }

    pub fn is_registered(&self, number: &str) -> bool {
        self.lookup(number).is_some()
    }

    pub fn update_last_seen(&self, number: &str) {
        let mut map = self.bindings.lock().unwrap();
        if let Some(b) = map.get_mut(number) {
            b.last_seen = Utc::now();
        }
    }

    /// 期限切れを一括除去して、消した内線番号を返す。
    pub fn cleanup(&self) -> Vec<String> {
        let now = Utc::now();
        let mut removed = Vec::new();
        let mut map = self.bindings.lock().unwrap();
        map.retain(|number, binding| {
            let alive = !binding.is_expired(now);
            if !alive {
                removed.push(number.clone());
            }
            alive
        });
        removed
    }

    pub fn list(&self) -> Vec<ContactBinding> {
        let now = Utc::now();
        let map = self.bindings.lock().unwrap();
        let mut users: Vec<ContactBinding> = map
            .values()
            .filter(|b| !b.is_expired(now))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.extension.cmp(&b.extension));
        users
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut map = self.bindings.lock().unwrap();
        let n = map.len();
        map.clear();
        n
    }

    pub fn history(&self, limit: usize, offset: usize) -> Vec<RegistrationRecord> {
        let history = self.history.lock().unwrap();
        history.iter().rev().skip(offset).take(limit).cloned().collect()
    }

    fn push_history(&self, record: RegistrationRecord) {
        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record);
    }
}
