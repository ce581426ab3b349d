//! 传输数据包格式
//!
//! 所有字段小端序，包头 `opcode: u16` + `id: u16`。
//!
//! | opcode | 数据包 | 载荷 |
//! |---|---|---|
//! | 0 | FileStart | client_type u16, fragments u16, total_size u32, file_no u16, filename_len u16, filename |
//! | 1 | FileSegment | fragment_no u16, fragment_size u32, data |
//! | 2 | FileEnd | - |
//! | 3 | FileStartResponse | accepted u8, reason u8 |
//! | 4 | FileEndResponse | success u8, reason u8 |
//! | 5 | BulkStart | client_type u16, file_count u16 |
//! | 6 | BulkEnd | aborted u8, reason u8 |
//! | 7 | BulkStartResponse | accepted u8, reason u8 |
//! | 8 | BulkEndResponse | success u8, reason u8 |

use crate::error::TransferError;

pub const OP_FILE_START: u16 = 0;
pub const OP_FILE_SEGMENT: u16 = 1;
pub const OP_FILE_END: u16 = 2;
pub const OP_FILE_START_RESPONSE: u16 = 3;
pub const OP_FILE_END_RESPONSE: u16 = 4;
pub const OP_BULK_START: u16 = 5;
pub const OP_BULK_END: u16 = 6;
pub const OP_BULK_START_RESPONSE: u16 = 7;
pub const OP_BULK_END_RESPONSE: u16 = 8;

/// 拒绝/失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reason {
    #[default]
    None = 0,
    Busy = 1,
    IncompatibleVersion = 2,
    Corrupt = 3,
    Aborted = 4,
    Invalid = 5,
}

impl Reason {
    /// 未知原因码按 `Invalid` 处理
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Reason::None,
            1 => Reason::Busy,
            2 => Reason::IncompatibleVersion,
            3 => Reason::Corrupt,
            4 => Reason::Aborted,
            _ => Reason::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::None => "none",
            Reason::Busy => "busy",
            Reason::IncompatibleVersion => "incompatible version",
            Reason::Corrupt => "corrupt",
            Reason::Aborted => "aborted",
            Reason::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输数据包
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    FileStart {
        id: u16,
        client_type: u16,
        fragments: u16,
        total_size: u32,
        file_no: u16,
        filename: Option<String>,
    },
    FileSegment {
        id: u16,
        fragment_no: u16,
        data: Vec<u8>,
    },
    FileEnd {
        id: u16,
    },
    FileStartResponse {
        id: u16,
        accepted: bool,
        reason: Reason,
    },
    FileEndResponse {
        id: u16,
        success: bool,
        reason: Reason,
    },
    BulkStart {
        id: u16,
        client_type: u16,
        file_count: u16,
    },
    BulkEnd {
        id: u16,
        aborted: bool,
        reason: Reason,
    },
    BulkStartResponse {
        id: u16,
        accepted: bool,
        reason: Reason,
    },
    BulkEndResponse {
        id: u16,
        success: bool,
        reason: Reason,
    },
}

impl Packet {
    pub fn opcode(&self) -> u16 {
        match self {
            Packet::FileStart { .. } => OP_FILE_START,
            Packet::FileSegment { .. } => OP_FILE_SEGMENT,
            Packet::FileEnd { .. } => OP_FILE_END,
            Packet::FileStartResponse { .. } => OP_FILE_START_RESPONSE,
            Packet::FileEndResponse { .. } => OP_FILE_END_RESPONSE,
            Packet::BulkStart { .. } => OP_BULK_START,
            Packet::BulkEnd { .. } => OP_BULK_END,
            Packet::BulkStartResponse { .. } => OP_BULK_START_RESPONSE,
            Packet::BulkEndResponse { .. } => OP_BULK_END_RESPONSE,
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            Packet::FileStart { id, .. }
            | Packet::FileSegment { id, .. }
            | Packet::FileEnd { id }
            | Packet::FileStartResponse { id, .. }
            | Packet::FileEndResponse { id, .. }
            | Packet::BulkStart { id, .. }
            | Packet::BulkEnd { id, .. }
            | Packet::BulkStartResponse { id, .. }
            | Packet::BulkEndResponse { id, .. } => *id,
        }
    }

    /// 编码为字节
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.opcode().to_le_bytes());
        buf.extend_from_slice(&self.id().to_le_bytes());

        match self {
            Packet::FileStart {
                client_type,
                fragments,
                total_size,
                file_no,
                filename,
                ..
            } => {
                let name = truncate_name(filename.as_deref().unwrap_or_default()).as_bytes();
                buf.extend_from_slice(&client_type.to_le_bytes());
                buf.extend_from_slice(&fragments.to_le_bytes());
                buf.extend_from_slice(&total_size.to_le_bytes());
                buf.extend_from_slice(&file_no.to_le_bytes());
                buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
                buf.extend_from_slice(name);
            }
            Packet::FileSegment {
                fragment_no, data, ..
            } => {
                buf.reserve(6 + data.len());
                buf.extend_from_slice(&fragment_no.to_le_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
            }
            Packet::FileEnd { .. } => {}
            Packet::FileStartResponse {
                accepted: flag,
                reason,
                ..
            }
            | Packet::FileEndResponse {
                success: flag,
                reason,
                ..
            }
            | Packet::BulkEnd {
                aborted: flag,
                reason,
                ..
            }
            | Packet::BulkStartResponse {
                accepted: flag,
                reason,
                ..
            }
            | Packet::BulkEndResponse {
                success: flag,
                reason,
                ..
            } => {
                buf.push(u8::from(*flag));
                buf.push(*reason as u8);
            }
            Packet::BulkStart {
                client_type,
                file_count,
                ..
            } => {
                buf.extend_from_slice(&client_type.to_le_bytes());
                buf.extend_from_slice(&file_count.to_le_bytes());
            }
        }

        buf
    }

    /// 从字节解码
    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        let mut r = Reader::new(bytes);
        let opcode = r.u16()?;
        let id = r.u16()?;

        let packet = match opcode {
            OP_FILE_START => {
                let client_type = r.u16()?;
                let fragments = r.u16()?;
                let total_size = r.u32()?;
                let file_no = r.u16()?;
                let name_len = r.u16()? as usize;
                let name = r.bytes(name_len)?;
                let filename = if name.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(name).into_owned())
                };
                Packet::FileStart {
                    id,
                    client_type,
                    fragments,
                    total_size,
                    file_no,
                    filename,
                }
            }
            OP_FILE_SEGMENT => {
                let fragment_no = r.u16()?;
                let size = r.u32()? as usize;
                let data = r.bytes(size)?.to_vec();
                Packet::FileSegment {
                    id,
                    fragment_no,
                    data,
                }
            }
            OP_FILE_END => Packet::FileEnd { id },
            OP_FILE_START_RESPONSE => Packet::FileStartResponse {
                id,
                accepted: r.flag()?,
                reason: r.reason()?,
            },
            OP_FILE_END_RESPONSE => Packet::FileEndResponse {
                id,
                success: r.flag()?,
                reason: r.reason()?,
            },
            OP_BULK_START => Packet::BulkStart {
                id,
                client_type: r.u16()?,
                file_count: r.u16()?,
            },
            OP_BULK_END => Packet::BulkEnd {
                id,
                aborted: r.flag()?,
                reason: r.reason()?,
            },
            OP_BULK_START_RESPONSE => Packet::BulkStartResponse {
                id,
                accepted: r.flag()?,
                reason: r.reason()?,
            },
            OP_BULK_END_RESPONSE => Packet::BulkEndResponse {
                id,
                success: r.flag()?,
                reason: r.reason()?,
            },
            other => {
                return Err(TransferError::Protocol(format!(
                    "Unknown opcode {}",
                    other
                )));
            }
        };

        Ok(packet)
    }
}

/// 小端字节读取
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], TransferError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                TransferError::Protocol(format!(
                    "Truncated packet: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TransferError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TransferError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, TransferError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn flag(&mut self) -> Result<bool, TransferError> {
        Ok(self.u8()? != 0)
    }

    fn reason(&mut self) -> Result<Reason, TransferError> {
        Ok(Reason::from_u8(self.u8()?))
    }
}

/// 文件名截断到长度字段能表示的字节数，不拆开多字节字符
fn truncate_name(name: &str) -> &str {
    let mut end = name.len().min(u16::MAX as usize);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_start_layout() {
        let packet = Packet::FileStart {
            id: 0x0102,
            client_type: 1,
            fragments: 3,
            total_size: 0x0A0B0C0D,
            file_no: 2,
            filename: Some("ab".to_string()),
        };
        let bytes = packet.encode();

        assert_eq!(
            bytes,
            vec![
                0, 0, // opcode
                0x02, 0x01, // id
                1, 0, // client_type
                3, 0, // fragments
                0x0D, 0x0C, 0x0B, 0x0A, // total_size
                2, 0, // file_no
                2, 0, // filename_len
                b'a', b'b',
            ]
        );
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_segment_and_responses() {
        let segment = Packet::FileSegment {
            id: 7,
            fragment_no: 1,
            data: vec![9, 9, 9],
        };
        let bytes = segment.encode();
        assert_eq!(&bytes[..4], &[1, 0, 7, 0]);
        assert_eq!(&bytes[4..10], &[1, 0, 3, 0, 0, 0]);
        assert_eq!(Packet::decode(&bytes).unwrap(), segment);

        let response = Packet::BulkStartResponse {
            id: 4,
            accepted: false,
            reason: Reason::Busy,
        };
        assert_eq!(response.encode(), vec![7, 0, 4, 0, 0, 1]);
        assert_eq!(Packet::decode(&response.encode()).unwrap(), response);
    }

    #[test]
    fn test_missing_filename_decodes_as_none() {
        let packet = Packet::FileStart {
            id: 1,
            client_type: 0,
            fragments: 1,
            total_size: 0,
            file_no: 0,
            filename: None,
        };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_decode_errors() {
        // 截断的包头
        assert!(matches!(
            Packet::decode(&[0, 0, 1]),
            Err(TransferError::Protocol(_))
        ));
        // 未知 opcode
        assert!(matches!(
            Packet::decode(&[42, 0, 1, 0]),
            Err(TransferError::Protocol(_))
        ));
        // 声明的分片长度超出实际数据
        assert!(matches!(
            Packet::decode(&[1, 0, 1, 0, 1, 0, 10, 0, 0, 0, 1, 2]),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_reason_maps_to_invalid() {
        assert_eq!(Reason::from_u8(3), Reason::Corrupt);
        assert_eq!(Reason::from_u8(200), Reason::Invalid);
        assert_eq!(Reason::IncompatibleVersion.to_string(), "incompatible version");
    }

    #[test]
    fn test_long_filename_truncated_on_char_boundary() {
        // 65534 个 ASCII 字节后接一个 3 字节字符，字节上限落在字符中间
        let name = format!("{}文件", "a".repeat(u16::MAX as usize - 1));
        let packet = Packet::FileStart {
            id: 1,
            client_type: 0,
            fragments: 1,
            total_size: 0,
            file_no: 0,
            filename: Some(name.clone()),
        };

        let Packet::FileStart { filename, .. } = Packet::decode(&packet.encode()).unwrap() else {
            panic!("expected FileStart");
        };
        let filename = filename.unwrap();
        assert_eq!(filename.len(), u16::MAX as usize - 1);
        assert!(name.starts_with(&filename));
        assert!(!filename.contains('\u{FFFD}'));
    }
}
