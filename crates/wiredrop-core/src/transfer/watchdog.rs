//! 空闲看门狗
//!
//! 传输结束后启动，对端在超时时间内没有发起新传输时触发一次，
//! 由协调器重置传输状态。每次 `start()` 都会递增代数，过期的触发会被忽略。

use log::{debug, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 默认超时 15 秒
pub const DEFAULT_WATCHDOG_DURATION: Duration = Duration::from_millis(15_000);
/// 默认容差 1 秒
pub const DEFAULT_WATCHDOG_LEEWAY: Duration = Duration::from_millis(1_000);

/// 看门狗触发，带启动代数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogTick {
    generation: u64,
}

impl WatchdogTick {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// 空闲看门狗
pub struct IdleWatchdog {
    duration: Duration,
    leeway: Duration,
    generation: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<WatchdogTick>,
}

impl IdleWatchdog {
    /// 创建看门狗，返回触发接收端
    pub fn new(
        duration: Duration,
        leeway: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WatchdogTick>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watchdog = Self {
            duration,
            leeway,
            generation: 0,
            armed: false,
            task: None,
            tx,
        };
        (watchdog, rx)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// 容差，仅作为计时精度提示
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 启动（或重新启动）计时
    pub fn start(&mut self) {
        self.cancel_task();
        self.generation += 1;
        self.armed = true;

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Idle watchdog needs an async runtime: {}", e);
                return;
            }
        };

        let tick = WatchdogTick {
            generation: self.generation,
        };
        let duration = self.duration;
        let tx = self.tx.clone();
        self.task = Some(runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(tick);
        }));

        debug!(
            "Idle watchdog armed for {:?} (generation {})",
            self.duration, self.generation
        );
    }

    /// 取消计时，未启动时无操作
    pub fn stop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        self.cancel_task();
        debug!("Idle watchdog stopped (generation {})", self.generation);
    }

    /// 判断触发是否属于当前计时周期，是则结束本周期
    pub fn accept(&mut self, tick: WatchdogTick) -> bool {
        if !self.armed || tick.generation != self.generation {
            debug!(
                "Ignoring stale watchdog tick (generation {}, current {})",
                tick.generation, self.generation
            );
            return false;
        }
        self.armed = false;
        self.task = None;
        true
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_tick(rx: &mut mpsc::UnboundedReceiver<WatchdogTick>, within: Duration) -> Option<WatchdogTick> {
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_duration() {
        let (mut watchdog, mut rx) = IdleWatchdog::new(Duration::from_secs(15), Duration::from_secs(1));
        watchdog.start();
        assert!(watchdog.is_armed());

        assert!(next_tick(&mut rx, Duration::from_secs(14)).await.is_none());
        let tick = next_tick(&mut rx, Duration::from_secs(2)).await.unwrap();

        assert!(watchdog.accept(tick));
        assert!(!watchdog.is_armed());
        // 同一周期只生效一次
        assert!(!watchdog.accept(tick));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let (mut watchdog, mut rx) = IdleWatchdog::new(Duration::from_secs(15), Duration::from_secs(1));
        watchdog.start();
        watchdog.stop();
        watchdog.stop();

        assert!(next_tick(&mut rx, Duration::from_secs(60)).await.is_none());
        assert!(!watchdog.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_pending_arm() {
        let (mut watchdog, mut rx) = IdleWatchdog::new(Duration::from_secs(15), Duration::from_secs(1));
        watchdog.start();
        assert!(next_tick(&mut rx, Duration::from_secs(10)).await.is_none());

        watchdog.start();
        assert_eq!(watchdog.generation(), 2);
        // 第一次启动的计时已取消
        assert!(next_tick(&mut rx, Duration::from_secs(10)).await.is_none());

        let tick = next_tick(&mut rx, Duration::from_secs(10)).await.unwrap();
        assert_eq!(tick.generation(), 2);
        assert!(watchdog.accept(tick));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tick_ignored() {
        let (mut watchdog, mut rx) = IdleWatchdog::new(Duration::from_secs(1), Duration::ZERO);
        watchdog.start();
        let stale = next_tick(&mut rx, Duration::from_secs(2)).await.unwrap();

        watchdog.start();
        assert!(!watchdog.accept(stale));
        assert!(watchdog.is_armed());
    }
}
