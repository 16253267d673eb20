//! 广播中枢
//!
//! 维护当前连接的 Listener 集合，把回复载荷推送给每一个连接：
//! - 读锁下拍快照，锁外投递
//! - 某个连接投递失败不影响其它连接，失败者随后被移除

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Listener closed")]
    Closed,

    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// 一个已连接的接收端
#[async_trait]
pub trait Listener: Send + Sync {
    fn id(&self) -> &str;

    async fn deliver(&self, payload: &str) -> Result<(), DeliveryError>;
}

/// 基于 mpsc 的 Listener：载荷进入通道，由连接的写任务发出
#[derive(Debug, Clone)]
pub struct ChannelListener {
    id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelListener {
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }
}

#[async_trait]
impl Listener for ChannelListener {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.tx
            .send(payload.to_string())
            .map_err(|_| DeliveryError::Closed)
    }
}

#[derive(Default)]
pub struct BroadcastHub {
    listeners: RwLock<HashMap<String, Arc<dyn Listener>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, listener: Arc<dyn Listener>) {
        let id = listener.id().to_string();
        let mut listeners = self.listeners.write().await;
        listeners.insert(id.clone(), listener);
        debug!(listener = %id, total = listeners.len(), "listener attached");
    }

    pub async fn detach(&self, id: &str) -> bool {
        let mut listeners = self.listeners.write().await;
        let removed = listeners.remove(id).is_some();
        if removed {
            debug!(listener = %id, total = listeners.len(), "listener detached");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listeners.read().await.is_empty()
    }

    /// 推送给所有连接，返回成功数；失败的连接被移除
    pub async fn broadcast(&self, payload: &str) -> usize {
        let snapshot: Vec<Arc<dyn Listener>> =
            self.listeners.read().await.values().cloned().collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for listener in snapshot {
            match listener.deliver(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(listener = %listener.id(), error = %e, "delivery failed, detaching");
                    failed.push(listener.id().to_string());
                }
            }
        }

        if !failed.is_empty() {
            let mut listeners = self.listeners.write().await;
            for id in &failed {
                listeners.remove(id);
            }
        }
        delivered
    }

    /// 序列化一次，所有连接收到相同文本
    pub async fn broadcast_json<T: Serialize>(&self, value: &T) -> usize {
        match serde_json::to_string(value) {
            Ok(payload) => self.broadcast(&payload).await,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast payload");
                0
            }
        }
    }
}
