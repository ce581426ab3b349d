//! 接收模式

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use wiredrop_core::{
    AppSettings, DeviceKind, DirectoryExporter, Endpoint, PeerConfig, PublishedTransferStatus,
    TcpConnection, TransferNotice, TransferSession, TransferState,
};

pub async fn run(
    settings: AppSettings,
    bind: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let bind = bind.unwrap_or_else(|| settings.listen_addr.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("无效的监听地址: {}", bind))?;
    let dir = output.unwrap_or_else(|| settings.download_dir.clone());

    let local = PeerConfig::new(settings.device_name.clone(), DeviceKind::Host);
    let (connection, events) = TcpConnection::new(Endpoint::Listen(addr), local);
    let session = TransferSession::start(
        connection,
        events,
        Arc::new(DirectoryExporter::new(&dir)),
        settings.session_options(),
    )?;

    println!("📥 接收模式 ({})", addr);
    println!("   保存到: {}", dir.display());
    println!("   按 Ctrl-C 退出");

    let mut status = session.subscribe();
    let mut notices = session.notices();
    let mut last = *status.borrow();
    let mut printed = 0.0;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                report(&last, &current, &mut printed);
                if current.state == TransferState::Complete {
                    // 目录导出没有界面，直接复位
                    session.export_did_complete()?;
                }
                last = current;
            }
            notice = notices.recv() => match notice {
                Ok(TransferNotice::Started { total }) => {
                    println!("📦 开始接收 {} 个文件", total);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} notices", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("⏹️  停止接收");
                break;
            }
        }
    }

    session.terminate().await;
    Ok(())
}

fn report(
    last: &PublishedTransferStatus,
    current: &PublishedTransferStatus,
    printed: &mut f64,
) {
    if last.connected != current.connected {
        if current.connected {
            println!("🔗 对端已连接");
        } else {
            println!("🔌 对端已断开");
        }
    }

    if last.state != current.state {
        match current.state {
            TransferState::None => {}
            TransferState::Complete => println!("✅ {}", current.state.receiver_title()),
            TransferState::Failed => println!("❌ {}", current.state.receiver_title()),
            _ => println!("   {}", current.state.receiver_title()),
        }
    }

    // 每 10% 打印一次进度
    if current.progress_bar_hidden || current.progress < *printed {
        *printed = 0.0;
    } else if current.progress - *printed >= 0.1 {
        println!("   进度: {:.1}%", current.progress * 100.0);
        *printed = current.progress;
    }
}
