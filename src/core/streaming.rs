//! StreamingProperty：可观察的当前值
//!
//! 基于 `tokio::sync::watch`：订阅时立即回放当前值，之后推送每次更新；
//! `finalize` 只生效一次，之后丢弃发送端，所有订阅在收到最终值后结束，再次 `set` 被忽略。

use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 可观察值：current value + subscribe-with-replay + one-shot finalize
#[derive(Debug)]
pub struct StreamingProperty<T> {
    tx: Mutex<Option<watch::Sender<T>>>,
    rx: watch::Receiver<T>,
}

impl<T> StreamingProperty<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// 当前值（finalize 之后仍可读取最终值）
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// 更新值；已 finalize 时返回 false 且不生效
    pub fn set(&self, value: T) -> bool {
        match self.sender().as_ref() {
            Some(tx) => {
                tx.send_replace(value);
                true
            }
            None => false,
        }
    }

    /// 原地修改并通知订阅者；已 finalize 时返回 false
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        match self.sender().as_ref() {
            Some(tx) => {
                tx.send_modify(f);
                true
            }
            None => false,
        }
    }

    /// 结束：可选写入最终值，之后不再接受更新。仅第一次调用返回 true
    pub fn finalize(&self, final_value: Option<T>) -> bool {
        let Some(tx) = self.sender().take() else {
            return false;
        };
        if let Some(v) = final_value {
            tx.send_replace(v);
        }
        drop(tx);
        true
    }

    pub fn is_finalized(&self) -> bool {
        self.sender().is_none()
    }

    /// 订阅：第一次 `next()` 立即返回当前值
    pub fn subscribe(&self) -> Subscription<T> {
        let mut rx = self.rx.clone();
        rx.mark_changed();
        Subscription { rx }
    }

    /// 以回调方式订阅（立即回放当前值），返回后台任务句柄；finalize 后任务自然结束
    pub fn observe<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&T) + Send + 'static,
    {
        let mut sub = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = sub.next().await {
                callback(&value);
            }
        })
    }

    /// 等待 finalize
    pub async fn finished(&self) {
        let mut rx = self.rx.clone();
        while rx.changed().await.is_ok() {}
    }

    fn sender(&self) -> std::sync::MutexGuard<'_, Option<watch::Sender<T>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 单个订阅者
#[derive(Debug)]
pub struct Subscription<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// 下一个值；属性已 finalize 且最终值已被读取后返回 None
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[tokio::test]
    async fn test_subscribe_replays_current_value() {
        let prop = StreamingProperty::new(1);
        prop.set(2);
        let mut sub = prop.subscribe();
        assert_eq!(sub.next().await, Some(2));
    }

    #[tokio::test]
    async fn test_finalize_freezes_value() {
        let prop = StreamingProperty::new("thinking".to_string());
        assert!(prop.finalize(Some("done".to_string())));
        assert!(!prop.set("again".to_string()));
        assert!(!prop.update(|v| v.push('!')));
        assert!(!prop.finalize(Some("twice".to_string())));
        assert_eq!(prop.get(), "done");
        assert!(prop.is_finalized());
    }

    #[tokio::test]
    async fn test_subscription_ends_after_final_value() {
        let prop = StreamingProperty::new(0);
        let mut sub = prop.subscribe();
        assert_eq!(sub.next().await, Some(0));
        prop.set(5);
        prop.finalize(Some(9));
        assert_eq!(sub.next().await, Some(9));
        assert_eq!(sub.next().await, None);
        prop.finished().await;
    }

    #[tokio::test]
    async fn test_observe_sees_replay_and_final() {
        let prop = StreamingProperty::new(vec![1]);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let handle = prop.observe(move |v: &Vec<i32>| seen_cb.lock().unwrap().push(v.len()));
        tokio::task::yield_now().await;
        prop.finalize(Some(vec![1, 2, 3]));
        handle.await.unwrap();
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen.last(), Some(&3));
    }
}
