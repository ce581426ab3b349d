//! 链路帧格式
//!
//! 帧头 8 字节（大端）: `frame_type: u32` + `payload_len: u32`
//! - 100: 设备身份（JSON 格式的 `PeerConfig`）
//! - 104: 原始数据包

use crate::connection::PeerConfig;
use crate::error::TransferError;
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_TYPE_DEVICE_IDENTIFICATION: u32 = 100;
pub const FRAME_TYPE_RAW_DATA: u32 = 104;

/// 单帧载荷上限
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Identification(PeerConfig),
    RawData(Vec<u8>),
}

impl Frame {
    pub fn frame_type(&self) -> u32 {
        match self {
            Frame::Identification(_) => FRAME_TYPE_DEVICE_IDENTIFICATION,
            Frame::RawData(_) => FRAME_TYPE_RAW_DATA,
        }
    }
}

/// 写入一帧
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TransferError> {
    let identification;
    let payload: &[u8] = match frame {
        Frame::Identification(config) => {
            identification = serde_json::to_vec(config)
                .map_err(|e| TransferError::Protocol(format!("Invalid identification: {}", e)))?;
            &identification
        }
        Frame::RawData(data) => data,
    };

    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransferError::Protocol(format!(
            "Frame too large: {} bytes",
            payload.len()
        )));
    }

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&frame.frame_type().to_be_bytes());
    header[4..].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一帧
///
/// 对端正常关闭时返回 `Ok(None)`，未知帧类型会被跳过。
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, TransferError> {
    loop {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let frame_type = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransferError::Protocol(format!(
                "Frame too large: {} bytes",
                len
            )));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        match frame_type {
            FRAME_TYPE_DEVICE_IDENTIFICATION => {
                let config = serde_json::from_slice(&payload).map_err(|e| {
                    TransferError::Protocol(format!("Invalid identification: {}", e))
                })?;
                return Ok(Some(Frame::Identification(config)));
            }
            FRAME_TYPE_RAW_DATA => return Ok(Some(Frame::RawData(payload))),
            other => {
                warn!("Skipping unknown frame type {} ({} bytes)", other, len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DeviceKind;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let config = PeerConfig::new("desk", DeviceKind::Host);

        write_frame(&mut a, &Frame::Identification(config.clone()))
            .await
            .unwrap();
        write_frame(&mut a, &Frame::RawData(vec![1, 2, 3]))
            .await
            .unwrap();
        drop(a);

        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Some(Frame::Identification(config))
        );
        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Some(Frame::RawData(vec![1, 2, 3]))
        );
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_frame_is_skipped() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        // 类型 7 的帧，载荷 2 字节
        a.write_all(&[0, 0, 0, 7, 0, 0, 0, 2, 0xAA, 0xBB])
            .await
            .unwrap();
        write_frame(&mut a, &Frame::RawData(vec![9])).await.unwrap();

        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Some(Frame::RawData(vec![9]))
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0, 0, 0, 104, 0xFF, 0xFF, 0xFF, 0xFF])
            .await
            .unwrap();

        let result = read_frame(&mut b).await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }
}
