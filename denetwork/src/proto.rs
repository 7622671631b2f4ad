//! Wire-level protocol constants: command codes, value-type tags, and the
//! handful of fixed numbers the protocol agrees on out of band.

/// Protocol version this crate speaks. Exchanged in the handshake so both
/// peers can reject a mismatched build instead of silently desyncing.
pub const DENETWORK_PROTOCOL: u16 = 0;

/// Default UDP port, used when an address string omits one.
pub const DEFAULT_PORT: u16 = 3413;

/// One byte at the head of every datagram identifying its payload shape.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    ConnectionRequest = 0x00,
    ConnectionAck = 0x01,
    ConnectionClose = 0x02,
    Message = 0x03,
    ReliableMessage = 0x04,
    ReliableAck = 0x05,
    ReliableLinkState = 0x06,
    ReliableMessageLong = 0x07,
    LinkUp = 0x08,
    LinkDown = 0x09,
    LinkUpdate = 0x0A,
}

impl Command {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Command> {
        use Command::*;
        Some(match byte {
            0x00 => ConnectionRequest,
            0x01 => ConnectionAck,
            0x02 => ConnectionClose,
            0x03 => Message,
            0x04 => ReliableMessage,
            0x05 => ReliableAck,
            0x06 => ReliableLinkState,
            0x07 => ReliableMessageLong,
            0x08 => LinkUp,
            0x09 => LinkDown,
            0x0A => LinkUpdate,
            _ => return None,
        })
    }
}

impl From<Command> for u8 {
    #[inline]
    fn from(cmd: Command) -> u8 {
        cmd as u8
    }
}

/// Result code carried by `CONNECTION_ACK`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionAckResult {
    Accept = 0,
    RejectNoCommonProtocol = 1,
    RejectOther = 2,
}

impl ConnectionAckResult {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<ConnectionAckResult> {
        use ConnectionAckResult::*;
        Some(match byte {
            0 => Accept,
            1 => RejectNoCommonProtocol,
            2 => RejectOther,
            _ => return None,
        })
    }
}

/// Result code carried by `RELIABLE_ACK`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ReliableAckResult {
    Success = 0,
    Failed = 1,
}

/// Reason accompanying `LINK_DOWN`, used outside the handshake too (an
/// unknown link-id or schema mismatch tears a link down mid-session).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum LinkDownReason {
    Rejected = 0,
    MismatchedSchema = 1,
    UnknownLink = 2,
}

impl LinkDownReason {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<LinkDownReason> {
        use LinkDownReason::*;
        Some(match byte {
            0 => Rejected,
            1 => MismatchedSchema,
            2 => UnknownLink,
            _ => return None,
        })
    }
}

/// Tag identifying a `Value`'s wire representation. Numbering matches
/// spec section 6 exactly; it is part of the wire contract.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Sint8 = 0,
    Uint8 = 1,
    Sint16 = 2,
    Uint16 = 3,
    Sint32 = 4,
    Uint32 = 5,
    Sint64 = 6,
    Uint64 = 7,
    Float16 = 8,
    Float32 = 9,
    Float64 = 10,
    String = 11,
    Data = 12,
    Point2S8 = 13,
    Point2U8 = 14,
    Point2S16 = 15,
    Point2U16 = 16,
    Point2S32 = 17,
    Point2U32 = 18,
    Point2S64 = 19,
    Point2U64 = 20,
    Point3S8 = 21,
    Point3U8 = 22,
    Point3S16 = 23,
    Point3U16 = 24,
    Point3S32 = 25,
    Point3U32 = 26,
    Point3S64 = 27,
    Point3U64 = 28,
    Vector2F16 = 29,
    Vector2F32 = 30,
    Vector2F64 = 31,
    Vector3F16 = 32,
    Vector3F32 = 33,
    Vector3F64 = 34,
    QuaternionF16 = 35,
    QuaternionF32 = 36,
    QuaternionF64 = 37,
}

impl ValueType {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<ValueType> {
        use ValueType::*;
        Some(match byte {
            0 => Sint8,
            1 => Uint8,
            2 => Sint16,
            3 => Uint16,
            4 => Sint32,
            5 => Uint32,
            6 => Sint64,
            7 => Uint64,
            8 => Float16,
            9 => Float32,
            10 => Float64,
            11 => String,
            12 => Data,
            13 => Point2S8,
            14 => Point2U8,
            15 => Point2S16,
            16 => Point2U16,
            17 => Point2S32,
            18 => Point2U32,
            19 => Point2S64,
            20 => Point2U64,
            21 => Point3S8,
            22 => Point3U8,
            23 => Point3S16,
            24 => Point3U16,
            25 => Point3S32,
            26 => Point3U32,
            27 => Point3S64,
            28 => Point3U64,
            29 => Vector2F16,
            30 => Vector2F32,
            31 => Vector2F64,
            32 => Vector3F16,
            33 => Vector3F32,
            34 => Vector3F64,
            35 => QuaternionF16,
            36 => QuaternionF32,
            37 => QuaternionF64,
            _ => return None,
        })
    }
}

impl From<ValueType> for u8 {
    #[inline]
    fn from(vt: ValueType) -> u8 {
        vt as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_byte_roundtrip() {
        for byte in 0x00u8..=0x0A {
            let cmd = Command::from_byte(byte).expect("known command code");
            assert_eq!(u8::from(cmd), byte);
        }
        assert!(Command::from_byte(0xFF).is_none());
    }

    #[test]
    fn value_type_byte_roundtrip() {
        for byte in 0u8..=37 {
            let vt = ValueType::from_byte(byte).expect("known value type");
            assert_eq!(u8::from(vt), byte);
        }
        assert!(ValueType::from_byte(38).is_none());
    }
}
