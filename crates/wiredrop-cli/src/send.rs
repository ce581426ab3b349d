//! 发送模式

use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wiredrop_core::transfer::TransferItem;
use wiredrop_core::{
    AppSettings, DeviceKind, DirectoryExporter, Endpoint, PathItem, PeerConfig,
    PublishedTransferStatus, TcpConnection, TransferSession, TransferState,
};

pub async fn run(
    settings: AppSettings,
    peer: &str,
    files: Vec<PathBuf>,
    timeout_secs: u64,
    idle_timeout_secs: u64,
) -> Result<()> {
    let addr: SocketAddr = peer
        .parse()
        .with_context(|| format!("无效的对端地址: {}", peer))?;

    let local = PeerConfig::new(settings.device_name.clone(), DeviceKind::App);
    let (connection, events) = TcpConnection::new(Endpoint::Dial(addr), local);
    let session = TransferSession::start(
        connection,
        events,
        Arc::new(DirectoryExporter::new(&settings.download_dir)),
        settings.session_options(),
    )?;

    let result = transfer(
        &session,
        addr,
        files,
        Duration::from_secs(timeout_secs),
        Duration::from_secs(idle_timeout_secs),
    )
    .await;
    session.terminate().await;
    result
}

async fn transfer(
    session: &TransferSession,
    addr: SocketAddr,
    files: Vec<PathBuf>,
    connect_timeout: Duration,
    idle_timeout: Duration,
) -> Result<()> {
    let mut status = session.subscribe();

    println!("🔗 连接 {} ...", addr);
    tokio::time::timeout(connect_timeout, status.wait_for(|s| s.connected))
        .await
        .with_context(|| format!("连接超时 ({}s)", connect_timeout.as_secs()))?
        .context("会话已结束")?;

    println!("📤 发送 {} 个文件", files.len());
    for file in &files {
        println!("   {}", file.display());
    }

    let items: Vec<Box<dyn TransferItem>> = files
        .into_iter()
        .map(|path| Box::new(PathItem::new(path)) as Box<dyn TransferItem>)
        .collect();
    session.send_items(items).await?;

    wait_for_outcome(&mut status, idle_timeout).await
}

/// 等待传输进入终态
///
/// App 端没有空闲看门狗，状态超过 `idle_timeout` 没有变化时放弃等待。
async fn wait_for_outcome(
    status: &mut watch::Receiver<PublishedTransferStatus>,
    idle_timeout: Duration,
) -> Result<()> {
    let mut printed = 0.0;
    let mut last_state = TransferState::None;
    loop {
        let current = *status.borrow_and_update();

        if current.state != last_state && !current.state.is_terminal() {
            println!("   {}", current.state.sender_title());
        }
        last_state = current.state;

        if !current.progress_bar_hidden && current.progress - printed >= 0.1 {
            println!("   进度: {:.1}%", current.progress * 100.0);
            printed = current.progress;
        }

        match current.state {
            TransferState::Complete => {
                println!("✅ {}", current.state.sender_title());
                return Ok(());
            }
            TransferState::Failed => {
                println!("❌ {}", current.state.sender_title());
                bail!("传输失败");
            }
            _ => {}
        }

        match tokio::time::timeout(idle_timeout, status.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => bail!("会话已结束"),
            Err(_) => bail!("传输无响应 ({}s 内状态未变化)", idle_timeout.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: TransferState, progress: f64) -> PublishedTransferStatus {
        PublishedTransferStatus {
            state,
            progress,
            progress_bar_hidden: state.is_progress_bar_hidden(),
            connected: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (_tx, mut rx) = watch::channel(status(TransferState::Waiting, 0.0));

        let err = wait_for_outcome(&mut rx, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("30s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_keeps_wait_alive() {
        let (tx, mut rx) = watch::channel(status(TransferState::Sending, 0.0));

        let updates = tokio::spawn(async move {
            for step in 1..=4 {
                tokio::time::sleep(Duration::from_secs(20)).await;
                tx.send(status(TransferState::Sending, f64::from(step) * 0.25))
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_secs(20)).await;
            tx.send(status(TransferState::Complete, 1.0)).unwrap();
        });

        wait_for_outcome(&mut rx, Duration::from_secs(30))
            .await
            .unwrap();
        updates.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_state_is_error() {
        let (_tx, mut rx) = watch::channel(status(TransferState::Failed, 0.0));

        let err = wait_for_outcome(&mut rx, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "传输失败");
    }
}
