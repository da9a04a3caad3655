use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeLevel {
    Info,
    Success,
    Alert,
    Error,
}

/// Consistency hazards surfaced to the user instead of failing the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncFault {
    TransientNetwork,
    StaleWriteLoss,
    AccountingLossRisk,
    OrderingDrift,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: String,
    pub level: NoticeLevel,
    pub message: String,
    pub fault: Option<SyncFault>,
    pub created_at: DateTime<Utc>,
}

/// Short-lived user notifications plus a bounded in-memory history.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notice>,
    history: Arc<Mutex<VecDeque<Notice>>>,
    capacity: usize,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity.max(64));
        Self {
            sender,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn info(&self, message: impl Into<String>) -> Notice {
        self.push(NoticeLevel::Info, message.into(), None)
    }

    pub fn success(&self, message: impl Into<String>) -> Notice {
        self.push(NoticeLevel::Success, message.into(), None)
    }

    pub fn alert(&self, message: impl Into<String>) -> Notice {
        self.push(NoticeLevel::Alert, message.into(), None)
    }

    pub fn error(&self, message: impl Into<String>) -> Notice {
        self.push(NoticeLevel::Error, message.into(), None)
    }

    pub fn fault(&self, fault: SyncFault, message: impl Into<String>) -> Notice {
        let level = match fault {
            SyncFault::OrderingDrift => NoticeLevel::Alert,
            _ => NoticeLevel::Error,
        };
        self.push(level, message.into(), Some(fault))
    }

    pub fn history(&self) -> Vec<Notice> {
        self.history
            .lock()
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push(&self, level: NoticeLevel, message: String, fault: Option<SyncFault>) -> Notice {
        let notice = Notice {
            id: Uuid::new_v4().to_string(),
            level,
            message,
            fault,
            created_at: Utc::now(),
        };
        if let Ok(mut history) = self.history.lock() {
            history.push_back(notice.clone());
            while history.len() > self.capacity {
                history.pop_front();
            }
        }
        let _ = self.sender.send(notice.clone());
        notice
    }
}
