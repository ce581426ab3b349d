//! 分片编解码器
//!
//! 发送端流程:
//! 1. FileStart → 等待 FileStartResponse
//! 2. 接受后依次发送全部分片（每片一个 `FragmentProgress`）
//! 3. FileEnd → 等待 FileEndResponse → `FileCompleted`
//!
//! 接收端在空闲且版本兼容时自动接受，否则以 `busy` / `incompatible version` 拒绝。
//!
//! 批量传输在外层包一次 BulkStart / BulkEnd 握手。
//! 新的发送命令会取代尚未结束的同类命令，旧 ID 的迟到回复直接忽略。

use crate::codec::wire::{Packet, Reason};
use crate::codec::{CodecEvent, CodecFactory, Direction, FileDescriptor, ProtocolCodec};
use crate::connection::{ConnectionVersion, DeviceKind, PacketSink};
use log::{debug, info, warn};
use std::sync::Arc;

/// 默认分片大小 64 KiB
pub const DEFAULT_FRAGMENT_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundPhase {
    AwaitingStart,
    AwaitingEnd,
}

struct OutboundFile {
    id: u16,
    data: Vec<u8>,
    fragment_size: usize,
    fragments: u16,
    file_no: u32,
    total_files: u32,
    phase: OutboundPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkPhase {
    AwaitingStart,
    Open,
    AwaitingEnd,
}

struct OutboundBulk {
    id: u16,
    total: u32,
    phase: BulkPhase,
}

struct InboundFile {
    id: u16,
    fragments: u16,
    total_size: u32,
    file_no: u16,
    total_files: u32,
    filename: Option<String>,
    received_fragments: u16,
    data: Vec<u8>,
    corrupt: bool,
}

struct InboundBulk {
    id: u16,
    file_count: u16,
    received: u16,
}

/// 分片编解码器
pub struct FragmentCodec {
    link: Arc<dyn PacketSink>,
    device_kind: DeviceKind,
    fragment_size: usize,
    version: Option<ConnectionVersion>,
    next_file_id: u16,
    next_bulk_id: u16,
    outbound_file: Option<OutboundFile>,
    outbound_bulk: Option<OutboundBulk>,
    inbound_file: Option<InboundFile>,
    inbound_bulk: Option<InboundBulk>,
}

impl FragmentCodec {
    pub fn new(link: Arc<dyn PacketSink>, device_kind: DeviceKind) -> Self {
        Self::with_fragment_size(link, device_kind, DEFAULT_FRAGMENT_SIZE)
    }

    pub fn with_fragment_size(
        link: Arc<dyn PacketSink>,
        device_kind: DeviceKind,
        fragment_size: usize,
    ) -> Self {
        Self {
            link,
            device_kind,
            fragment_size: fragment_size.max(1),
            version: None,
            // 随机起始 ID，避免重连后与对端残留状态混淆
            next_file_id: rand::random(),
            next_bulk_id: rand::random(),
            outbound_file: None,
            outbound_bulk: None,
            inbound_file: None,
            inbound_bulk: None,
        }
    }

    /// 版本是否兼容，未设置版本时视为兼容
    pub fn is_version_compatible(&self) -> bool {
        self.version.is_none_or(|v| {
            v.local_version >= v.remote_min_version && v.remote_version >= v.local_min_version
        })
    }

    fn send(&self, packet: &Packet) -> Result<(), String> {
        self.link
            .send_packet(packet.encode())
            .map_err(|e| e.to_string())
    }

    fn client_type(&self) -> u16 {
        self.device_kind.id() as u16
    }

    fn is_sending(&self) -> bool {
        self.outbound_file.is_some() || self.outbound_bulk.is_some()
    }

    /// 计算分片大小和分片数，分片数需能放进 u16
    fn plan_fragments(&self, len: usize) -> (usize, u16) {
        let max_fragments = u16::MAX as usize;
        let size = self.fragment_size.max(len.div_ceil(max_fragments));
        let fragments = len.div_ceil(size).max(1);
        (size, fragments as u16)
    }

    // ------------------------------------------------------------------
    // 发送端
    // ------------------------------------------------------------------

    fn on_file_start_response(&mut self, id: u16, accepted: bool, reason: Reason) -> Vec<CodecEvent> {
        let Some(file) = self
            .outbound_file
            .take_if(|f| f.id == id && f.phase == OutboundPhase::AwaitingStart)
        else {
            debug!("Ignoring stale FileStartResponse for {}", id);
            return Vec::new();
        };

        if !accepted {
            info!("Peer rejected file {}: {}", id, reason);
            return vec![CodecEvent::FileFailed {
                direction: Direction::Outbound,
                file_id: u32::from(id),
                reason: reason.to_string(),
            }];
        }

        let mut events = vec![CodecEvent::FileAccepted {
            direction: Direction::Outbound,
            file_id: u32::from(id),
            file_no: file.file_no,
            total: file.total_files,
        }];

        let fragments = u32::from(file.fragments);
        for fragment_no in 1..=file.fragments {
            let start = (usize::from(fragment_no) - 1) * file.fragment_size;
            let end = (start + file.fragment_size).min(file.data.len());
            let data = file.data.get(start..end).unwrap_or_default().to_vec();

            let segment = Packet::FileSegment {
                id,
                fragment_no,
                data,
            };
            if let Err(e) = self.send(&segment) {
                warn!("Failed to send fragment {} of file {}: {}", fragment_no, id, e);
                events.push(CodecEvent::FileFailed {
                    direction: Direction::Outbound,
                    file_id: u32::from(id),
                    reason: e,
                });
                return events;
            }

            events.push(CodecEvent::FragmentProgress {
                direction: Direction::Outbound,
                fragment: u32::from(fragment_no),
                fragments,
                file_no: file.file_no,
                total_files: file.total_files,
            });
        }

        if let Err(e) = self.send(&Packet::FileEnd { id }) {
            events.push(CodecEvent::FileFailed {
                direction: Direction::Outbound,
                file_id: u32::from(id),
                reason: e,
            });
            return events;
        }

        self.outbound_file = Some(OutboundFile {
            phase: OutboundPhase::AwaitingEnd,
            data: Vec::new(),
            ..file
        });
        events
    }

    fn on_file_end_response(&mut self, id: u16, success: bool, reason: Reason) -> Vec<CodecEvent> {
        if self
            .outbound_file
            .take_if(|f| f.id == id && f.phase == OutboundPhase::AwaitingEnd)
            .is_none()
        {
            debug!("Ignoring stale FileEndResponse for {}", id);
            return Vec::new();
        }

        if success {
            vec![CodecEvent::FileCompleted {
                direction: Direction::Outbound,
                file_id: u32::from(id),
            }]
        } else {
            warn!("Peer failed to receive file {}: {}", id, reason);
            vec![CodecEvent::FileFailed {
                direction: Direction::Outbound,
                file_id: u32::from(id),
                reason: reason.to_string(),
            }]
        }
    }

    fn on_bulk_start_response(&mut self, id: u16, accepted: bool, reason: Reason) -> Vec<CodecEvent> {
        let Some(bulk) = self
            .outbound_bulk
            .as_mut()
            .filter(|b| b.id == id && b.phase == BulkPhase::AwaitingStart)
        else {
            debug!("Ignoring stale BulkStartResponse for {}", id);
            return Vec::new();
        };

        let total = bulk.total;
        if accepted {
            bulk.phase = BulkPhase::Open;
        } else {
            info!("Peer rejected bulk transfer {}: {}", id, reason);
            self.outbound_bulk = None;
        }

        vec![CodecEvent::BulkAccepted {
            direction: Direction::Outbound,
            accepted,
            bulk_id: i32::from(id),
            total,
        }]
    }

    fn on_bulk_end_response(&mut self, id: u16, success: bool, reason: Reason) -> Vec<CodecEvent> {
        if self
            .outbound_bulk
            .take_if(|b| b.id == id && b.phase == BulkPhase::AwaitingEnd)
            .is_none()
        {
            debug!("Ignoring stale BulkEndResponse for {}", id);
            return Vec::new();
        }

        if !success {
            warn!("Bulk transfer {} ended unsuccessfully: {}", id, reason);
        }
        vec![CodecEvent::BulkEnded {
            direction: Direction::Outbound,
            success,
            bulk_id: i32::from(id),
        }]
    }

    // ------------------------------------------------------------------
    // 接收端
    // ------------------------------------------------------------------

    fn respond(&self, packet: Packet) {
        if let Err(e) = self.send(&packet) {
            warn!("Failed to send {:?} response: {}", packet.opcode(), e);
        }
    }

    fn on_file_start(
        &mut self,
        id: u16,
        fragments: u16,
        total_size: u32,
        file_no: u16,
        filename: Option<String>,
    ) -> Vec<CodecEvent> {
        let reject = |reason: Reason| Packet::FileStartResponse {
            id,
            accepted: false,
            reason,
        };

        if !self.is_version_compatible() {
            warn!("Rejecting file {}: incompatible protocol version", id);
            self.respond(reject(Reason::IncompatibleVersion));
            return Vec::new();
        }
        if self.is_sending() {
            info!("Rejecting file {}: busy sending", id);
            self.respond(reject(Reason::Busy));
            return Vec::new();
        }
        if fragments == 0 {
            self.respond(reject(Reason::Invalid));
            return Vec::new();
        }
        if let Some(bulk) = &self.inbound_bulk
            && bulk.received >= bulk.file_count
        {
            warn!("Rejecting file {}: bulk {} already complete", id, bulk.id);
            self.respond(reject(Reason::Invalid));
            return Vec::new();
        }

        if let Some(previous) = &self.inbound_file {
            debug!("File {} superseded by file {}", previous.id, id);
        }

        let total_files = self
            .inbound_bulk
            .as_ref()
            .map_or(1, |b| u32::from(b.file_count));

        self.inbound_file = Some(InboundFile {
            id,
            fragments,
            total_size,
            file_no,
            total_files,
            filename,
            received_fragments: 0,
            data: Vec::with_capacity(total_size.min(64 * 1024 * 1024) as usize),
            corrupt: false,
        });
        self.respond(Packet::FileStartResponse {
            id,
            accepted: true,
            reason: Reason::None,
        });

        vec![CodecEvent::FileAccepted {
            direction: Direction::Inbound,
            file_id: u32::from(id),
            file_no: u32::from(file_no),
            total: total_files,
        }]
    }

    fn on_file_segment(&mut self, id: u16, fragment_no: u16, data: &[u8]) -> Vec<CodecEvent> {
        let Some(file) = self.inbound_file.as_mut().filter(|f| f.id == id) else {
            debug!("Ignoring segment for unknown file {}", id);
            return Vec::new();
        };
        if file.corrupt {
            return Vec::new();
        }

        let expected = file.received_fragments.wrapping_add(1);
        if fragment_no != expected
            || fragment_no > file.fragments
            || file.data.len() + data.len() > file.total_size as usize
        {
            warn!(
                "File {} corrupt: got fragment {} expected {}",
                id, fragment_no, expected
            );
            file.corrupt = true;
            return Vec::new();
        }

        file.data.extend_from_slice(data);
        file.received_fragments = fragment_no;

        vec![CodecEvent::FragmentProgress {
            direction: Direction::Inbound,
            fragment: u32::from(fragment_no),
            fragments: u32::from(file.fragments),
            file_no: u32::from(file.file_no),
            total_files: file.total_files,
        }]
    }

    fn on_file_end(&mut self, id: u16) -> Vec<CodecEvent> {
        let Some(file) = self.inbound_file.take_if(|f| f.id == id) else {
            debug!("Ignoring FileEnd for unknown file {}", id);
            return Vec::new();
        };

        let success = !file.corrupt
            && file.received_fragments == file.fragments
            && file.data.len() == file.total_size as usize;

        self.respond(Packet::FileEndResponse {
            id,
            success,
            reason: if success {
                Reason::None
            } else {
                Reason::Corrupt
            },
        });

        if !success {
            return vec![CodecEvent::FileFailed {
                direction: Direction::Inbound,
                file_id: u32::from(id),
                reason: Reason::Corrupt.to_string(),
            }];
        }

        if let Some(bulk) = self.inbound_bulk.as_mut() {
            bulk.received += 1;
        }

        vec![
            CodecEvent::FileReceived {
                payload: file.data,
                filename: file.filename,
            },
            CodecEvent::FileCompleted {
                direction: Direction::Inbound,
                file_id: u32::from(id),
            },
        ]
    }

    fn on_bulk_start(&mut self, id: u16, file_count: u16) -> Vec<CodecEvent> {
        let reject = |reason: Reason| Packet::BulkStartResponse {
            id,
            accepted: false,
            reason,
        };

        if !self.is_version_compatible() {
            warn!("Rejecting bulk {}: incompatible protocol version", id);
            self.respond(reject(Reason::IncompatibleVersion));
            return Vec::new();
        }
        if self.is_sending() {
            info!("Rejecting bulk {}: busy sending", id);
            self.respond(reject(Reason::Busy));
            return Vec::new();
        }
        if file_count == 0 {
            self.respond(reject(Reason::Invalid));
            return Vec::new();
        }

        if let Some(previous) = &self.inbound_bulk {
            debug!("Bulk {} superseded by bulk {}", previous.id, id);
        }
        self.inbound_file = None;
        self.inbound_bulk = Some(InboundBulk {
            id,
            file_count,
            received: 0,
        });
        self.respond(Packet::BulkStartResponse {
            id,
            accepted: true,
            reason: Reason::None,
        });

        vec![CodecEvent::BulkAccepted {
            direction: Direction::Inbound,
            accepted: true,
            bulk_id: i32::from(id),
            total: u32::from(file_count),
        }]
    }

    fn on_bulk_end(&mut self, id: u16, aborted: bool) -> Vec<CodecEvent> {
        let Some(bulk) = self.inbound_bulk.take_if(|b| b.id == id) else {
            debug!("Ignoring BulkEnd for unknown bulk {}", id);
            return Vec::new();
        };
        self.inbound_file = None;

        let success = !aborted && bulk.received == bulk.file_count;
        let reason = if success {
            Reason::None
        } else if aborted {
            Reason::Aborted
        } else {
            Reason::Invalid
        };
        if !success {
            info!(
                "Bulk {} failed: {} ({}/{} files)",
                id, reason, bulk.received, bulk.file_count
            );
        }

        self.respond(Packet::BulkEndResponse {
            id,
            success,
            reason,
        });

        vec![CodecEvent::BulkEnded {
            direction: Direction::Inbound,
            success,
            bulk_id: i32::from(id),
        }]
    }
}

impl ProtocolCodec for FragmentCodec {
    fn set_connection_version(&mut self, version: ConnectionVersion) {
        debug!("Connection version: {:?}", version);
        self.version = Some(version);
    }

    fn send_file(&mut self, file: FileDescriptor) -> Vec<CodecEvent> {
        let id = self.next_file_id;
        self.next_file_id = self.next_file_id.wrapping_add(1);

        if let Some(previous) = &self.outbound_file {
            debug!("Outbound file {} superseded by {}", previous.id, id);
        }
        self.outbound_file = None;

        let fail = |reason: String| {
            vec![CodecEvent::FileFailed {
                direction: Direction::Outbound,
                file_id: u32::from(id),
                reason,
            }]
        };

        let Ok(total_size) = u32::try_from(file.data.len()) else {
            warn!("File too large to send: {} bytes", file.data.len());
            return fail(Reason::Invalid.to_string());
        };
        let Ok(file_no) = u16::try_from(file.index) else {
            return fail(Reason::Invalid.to_string());
        };

        let (fragment_size, fragments) = self.plan_fragments(file.data.len());
        let start = Packet::FileStart {
            id,
            client_type: self.client_type(),
            fragments,
            total_size,
            file_no,
            filename: file.filename,
        };
        if let Err(e) = self.send(&start) {
            warn!("Failed to start file {}: {}", id, e);
            return fail(e);
        }

        debug!(
            "FileStart {} sent: {} bytes in {} fragments",
            id, total_size, fragments
        );
        self.outbound_file = Some(OutboundFile {
            id,
            data: file.data,
            fragment_size,
            fragments,
            file_no: file.index,
            total_files: file.total_in_batch,
            phase: OutboundPhase::AwaitingStart,
        });
        Vec::new()
    }

    fn start_bulk_transfer(&mut self, total: u32) -> Vec<CodecEvent> {
        let id = self.next_bulk_id;
        self.next_bulk_id = self.next_bulk_id.wrapping_add(1);

        if let Some(previous) = &self.outbound_bulk {
            debug!("Outbound bulk {} superseded by {}", previous.id, id);
        }
        self.outbound_bulk = None;
        self.outbound_file = None;

        let rejected = vec![CodecEvent::BulkAccepted {
            direction: Direction::Outbound,
            accepted: false,
            bulk_id: i32::from(id),
            total,
        }];

        let Ok(file_count) = u16::try_from(total) else {
            warn!("Too many files for one bulk transfer: {}", total);
            return rejected;
        };

        let start = Packet::BulkStart {
            id,
            client_type: self.client_type(),
            file_count,
        };
        if let Err(e) = self.send(&start) {
            warn!("Failed to start bulk {}: {}", id, e);
            return rejected;
        }

        self.outbound_bulk = Some(OutboundBulk {
            id,
            total,
            phase: BulkPhase::AwaitingStart,
        });
        Vec::new()
    }

    fn end_bulk_transfer(&mut self, aborted: bool) -> Vec<CodecEvent> {
        let Some(bulk) = self.outbound_bulk.as_mut() else {
            warn!("end_bulk_transfer called without an open bulk transfer");
            return Vec::new();
        };
        let id = bulk.id;
        bulk.phase = BulkPhase::AwaitingEnd;
        if aborted {
            self.outbound_file = None;
        }

        let end = Packet::BulkEnd {
            id,
            aborted,
            reason: if aborted { Reason::Aborted } else { Reason::None },
        };
        if let Err(e) = self.send(&end) {
            warn!("Failed to end bulk {}: {}", id, e);
            self.outbound_bulk = None;
            return vec![CodecEvent::BulkEnded {
                direction: Direction::Outbound,
                success: false,
                bulk_id: i32::from(id),
            }];
        }
        Vec::new()
    }

    fn feed(&mut self, packet: &[u8]) -> Vec<CodecEvent> {
        let packet = match Packet::decode(packet) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed packet: {}", e);
                return Vec::new();
            }
        };

        match packet {
            Packet::FileStart {
                id,
                fragments,
                total_size,
                file_no,
                filename,
                ..
            } => self.on_file_start(id, fragments, total_size, file_no, filename),
            Packet::FileSegment {
                id,
                fragment_no,
                data,
            } => self.on_file_segment(id, fragment_no, &data),
            Packet::FileEnd { id } => self.on_file_end(id),
            Packet::FileStartResponse {
                id,
                accepted,
                reason,
            } => self.on_file_start_response(id, accepted, reason),
            Packet::FileEndResponse {
                id,
                success,
                reason,
            } => self.on_file_end_response(id, success, reason),
            Packet::BulkStart { id, file_count, .. } => self.on_bulk_start(id, file_count),
            Packet::BulkEnd { id, aborted, .. } => self.on_bulk_end(id, aborted),
            Packet::BulkStartResponse {
                id,
                accepted,
                reason,
            } => self.on_bulk_start_response(id, accepted, reason),
            Packet::BulkEndResponse {
                id,
                success,
                reason,
            } => self.on_bulk_end_response(id, success, reason),
        }
    }
}

/// 创建 `FragmentCodec` 的工厂
#[derive(Debug, Clone, Copy)]
pub struct FragmentCodecFactory {
    pub fragment_size: usize,
}

impl Default for FragmentCodecFactory {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }
}

impl CodecFactory for FragmentCodecFactory {
    fn create(
        &self,
        link: Arc<dyn PacketSink>,
        device_kind: DeviceKind,
    ) -> Box<dyn ProtocolCodec> {
        Box::new(FragmentCodec::with_fragment_size(
            link,
            device_kind,
            self.fragment_size,
        ))
    }
}
