// # Wire Protocol Definitions
//
// Command and response codes, descriptor field masks, and chunk lead-byte
// encodings for the binary protocol. These values are fixed by the
// protocol; peers agree on the version by configuration (there is no
// negotiation), so nothing here may be renumbered.

pub mod buffers;
pub mod builders;
pub mod chunks;
pub mod io;

/// Default server port
pub const DEFAULT_PORT: u16 = 8120;

/// Value of the optional integrity check marker trailing a frame
pub const INTEGRITY_MARKER: u8 = 0xC3;

/// Smallest payload eligible for a compression attempt, bytes
pub const DEFAULT_COMPRESSION_THRESHOLD: u32 = 2048;

///////////////////////////////////////////////////////////////////////////
// COMMAND IDS
///////////////////////////////////////////////////////////////////////////

/// Protocol command set; the numeric values go over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ping = 0x01,
    Check = 0x02,
    Info = 0x10,
    Stats = 0x11,
    Read = 0x21,
    Write = 0x22,
    Destroy = 0x23,
    Gc = 0x24,
    Load = 0x41,
    Test = 0x42,
    Save = 0x43,
    Remove = 0x44,
    Clean = 0x45,
    GetIds = 0x61,
    GetTags = 0x62,
    GetIdsMatchingTags = 0x63,
    GetIdsNotMatchingTags = 0x64,
    GetIdsMatchingAnyTags = 0x65,
    GetFillingPercentage = 0x67,
    GetMetadatas = 0x68,
    Touch = 0x69,
    Shutdown = 0xF0,
    LoadConfig = 0xF1,
    Restore = 0xF2,
    Store = 0xF3,
    Get = 0xF5,
    Set = 0xF6,
    Log = 0xFA,
    Rotate = 0xFB,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Command> {
        match byte {
            0x01 => Some(Command::Ping),
            0x02 => Some(Command::Check),
            0x10 => Some(Command::Info),
            0x11 => Some(Command::Stats),
            0x21 => Some(Command::Read),
            0x22 => Some(Command::Write),
            0x23 => Some(Command::Destroy),
            0x24 => Some(Command::Gc),
            0x41 => Some(Command::Load),
            0x42 => Some(Command::Test),
            0x43 => Some(Command::Save),
            0x44 => Some(Command::Remove),
            0x45 => Some(Command::Clean),
            0x61 => Some(Command::GetIds),
            0x62 => Some(Command::GetTags),
            0x63 => Some(Command::GetIdsMatchingTags),
            0x64 => Some(Command::GetIdsNotMatchingTags),
            0x65 => Some(Command::GetIdsMatchingAnyTags),
            0x67 => Some(Command::GetFillingPercentage),
            0x68 => Some(Command::GetMetadatas),
            0x69 => Some(Command::Touch),
            0xF0 => Some(Command::Shutdown),
            0xF1 => Some(Command::LoadConfig),
            0xF2 => Some(Command::Restore),
            0xF3 => Some(Command::Store),
            0xF5 => Some(Command::Get),
            0xF6 => Some(Command::Set),
            0xFA => Some(Command::Log),
            0xFB => Some(Command::Rotate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Check => "CHECK",
            Command::Info => "INFO",
            Command::Stats => "STATS",
            Command::Read => "READ",
            Command::Write => "WRITE",
            Command::Destroy => "DESTROY",
            Command::Gc => "GC",
            Command::Load => "LOAD",
            Command::Test => "TEST",
            Command::Save => "SAVE",
            Command::Remove => "REMOVE",
            Command::Clean => "CLEAN",
            Command::GetIds => "GETIDS",
            Command::GetTags => "GETTAGS",
            Command::GetIdsMatchingTags => "GETIDSMATCHINGTAGS",
            Command::GetIdsNotMatchingTags => "GETIDSNOTMATCHINGTAGS",
            Command::GetIdsMatchingAnyTags => "GETIDSMATCHINGANYTAGS",
            Command::GetFillingPercentage => "GETFILLINGPERCENTAGE",
            Command::GetMetadatas => "GETMETADATAS",
            Command::Touch => "TOUCH",
            Command::Shutdown => "SHUTDOWN",
            Command::LoadConfig => "LOADCONFIG",
            Command::Restore => "RESTORE",
            Command::Store => "STORE",
            Command::Get => "GET",
            Command::Set => "SET",
            Command::Log => "LOG",
            Command::Rotate => "ROTATE",
        }
    }

    /// Authentication level a peer must present for this command.
    pub fn required_auth(self) -> AuthLevel {
        match self {
            Command::Info
            | Command::Stats
            | Command::Shutdown
            | Command::LoadConfig
            | Command::Restore
            | Command::Store
            | Command::Get
            | Command::Set
            | Command::Log
            | Command::Rotate => AuthLevel::Admin,
            _ => AuthLevel::User,
        }
    }

    /// Whether the command mutates the store and therefore goes to the
    /// binlog and to replication peers.
    pub fn is_write_class(self) -> bool {
        matches!(
            self,
            Command::Write
                | Command::Destroy
                | Command::Gc
                | Command::Save
                | Command::Remove
                | Command::Clean
                | Command::Touch
        )
    }
}

///////////////////////////////////////////////////////////////////////////
// COMMAND DESCRIPTOR ENCODING
///////////////////////////////////////////////////////////////////////////

pub const DESC_AUTH_BITS: u8 = 0x03;
pub const DESC_NO_AUTH: u8 = 0x00;
pub const DESC_USER_AUTH: u8 = 0x01;
pub const DESC_ADMIN_AUTH: u8 = 0x02;
pub const DESC_BULK_AUTH: u8 = 0x03;

pub const DESC_HEADER_BITS: u8 = 0x0C;
pub const DESC_NO_HEADER: u8 = 0x00;
pub const DESC_BYTE_HEADER: u8 = 0x04;
pub const DESC_WORD_HEADER: u8 = 0x08;
pub const DESC_DWORD_HEADER: u8 = 0x0C;

pub const DESC_PAYLOAD_BITS: u8 = 0x30;
pub const DESC_NO_PAYLOAD: u8 = 0x00;
pub const DESC_BYTE_PAYLOAD: u8 = 0x10;
pub const DESC_WORD_PAYLOAD: u8 = 0x20;
pub const DESC_DWORD_PAYLOAD: u8 = 0x30;

pub const DESC_PAYLOAD_IS_COMPRESSED: u8 = 0x40;
pub const DESC_MARKER_IS_PRESENT: u8 = 0x80;

/// Authentication level carried in the low descriptor bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AuthLevel {
    None = 0,
    User = 1,
    Admin = 2,
    Bulk = 3,
}

impl AuthLevel {
    pub fn from_descriptor(descriptor: u8) -> AuthLevel {
        match descriptor & DESC_AUTH_BITS {
            DESC_USER_AUTH => AuthLevel::User,
            DESC_ADMIN_AUTH => AuthLevel::Admin,
            DESC_BULK_AUTH => AuthLevel::Bulk,
            _ => AuthLevel::None,
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// RESPONSE DESCRIPTOR ENCODING
///////////////////////////////////////////////////////////////////////////

pub const RESP_TYPE_BITS: u8 = 0x03;
pub const RESP_TYPE_OK: u8 = 0x00;
pub const RESP_TYPE_DATA: u8 = 0x01;
pub const RESP_TYPE_LIST: u8 = 0x02;
pub const RESP_TYPE_ERROR: u8 = 0x03;

/// Response class carried in the low descriptor bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    Ok = 0,
    Data = 1,
    List = 2,
    Error = 3,
}

impl ResponseType {
    pub fn from_descriptor(descriptor: u8) -> ResponseType {
        match descriptor & RESP_TYPE_BITS {
            RESP_TYPE_DATA => ResponseType::Data,
            RESP_TYPE_LIST => ResponseType::List,
            RESP_TYPE_ERROR => ResponseType::Error,
            _ => ResponseType::Ok,
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// HEADER DATA CHUNK ENCODING
///////////////////////////////////////////////////////////////////////////

pub const CHNK_TYPE_BITS: u8 = 0xC0;
pub const CHNK_INTEGER: u8 = 0x00; // positive integer 8..71
pub const CHNK_STRING: u8 = 0x40; // string of length 8..71
pub const CHNK_LIST: u8 = 0x80; // list with 8..71 elements
pub const CHNK_SUBTYPE: u8 = 0xC0; // type encoded by bits 3..5
pub const CHNK_LONG_MASK: u8 = 0x3F;

pub const CHNK_SUBTYPE_BITS: u8 = 0x38;
pub const CHNK_SMALL_NEGATIVE: u8 = 0; // negative integer -1..-8
pub const CHNK_BIG_NEGATIVE: u8 = 1 << 3; // negative integer -9.., 1..4 bytes follow
pub const CHNK_SMALL_INTEGER: u8 = 2 << 3; // integer 0..7
pub const CHNK_SHORT_STRING: u8 = 3 << 3; // string of length 0..7
pub const CHNK_SHORT_LIST: u8 = 4 << 3; // list with 0..7 elements
pub const CHNK_BIG_INTEGER: u8 = 5 << 3; // integer 72.., 1..4 bytes follow
pub const CHNK_LONG_STRING: u8 = 6 << 3; // string of length 72.., 1..4 size bytes follow
pub const CHNK_LONG_LIST: u8 = 7 << 3; // list with 72.. elements, 1..4 count bytes follow
pub const CHNK_SHORT_MASK: u8 = 0x07;

pub const CHNK_MEDIUM_BIAS: u32 = 8;
pub const CHNK_LARGE_BIAS: u32 = 72;
pub const CHNK_SMALL_NEGATIVE_BIAS: i64 = -1;
pub const CHNK_BIG_NEGATIVE_BIAS: i64 = -9;

///////////////////////////////////////////////////////////////////////////
// USER AGENT TYPES
///////////////////////////////////////////////////////////////////////////

/// Coarse classification of the request origin; drives default lifetimes
/// and eviction priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UserAgent {
    Unknown = 0,
    Bot = 1,
    Warmer = 2,
    User = 3,
}

pub const NUM_USER_AGENTS: usize = 4;

impl UserAgent {
    pub fn from_byte(byte: u8) -> Option<UserAgent> {
        match byte {
            0 => Some(UserAgent::Unknown),
            1 => Some(UserAgent::Bot),
            2 => Some(UserAgent::Warmer),
            3 => Some(UserAgent::User),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UserAgent::Unknown => "unknown",
            UserAgent::Bot => "bot",
            UserAgent::Warmer => "warmer",
            UserAgent::User => "user",
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// CLEAN COMMAND MODES
///////////////////////////////////////////////////////////////////////////

/// Cleanup modes passed with the FPC `CLEAN` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CleanMode {
    All = 1,
    Old = 2,
    MatchingAllTags = 3,
    NotMatchingAnyTag = 4,
    MatchingAnyTag = 5,
}

impl CleanMode {
    pub fn from_byte(byte: u8) -> Option<CleanMode> {
        match byte {
            1 => Some(CleanMode::All),
            2 => Some(CleanMode::Old),
            3 => Some(CleanMode::MatchingAllTags),
            4 => Some(CleanMode::NotMatchingAnyTag),
            5 => Some(CleanMode::MatchingAnyTag),
            _ => None,
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// DOMAIN MASKS FOR INFORMATION / ADMIN COMMANDS
///////////////////////////////////////////////////////////////////////////

pub const DM_NONE: u8 = 0x00;
pub const DM_GLOBAL: u8 = 0x01;
pub const DM_SESSION: u8 = 0x02;
pub const DM_FPC: u8 = 0x04;
pub const DM_ALL: u8 = DM_GLOBAL | DM_SESSION | DM_FPC;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_byte_round_trip() {
        for byte in 0..=255u8 {
            if let Some(cmd) = Command::from_byte(byte) {
                assert_eq!(cmd as u8, byte);
            }
        }
        assert_eq!(Command::from_byte(0x01), Some(Command::Ping));
        assert_eq!(Command::from_byte(0x69), Some(Command::Touch));
        assert_eq!(Command::from_byte(0x00), None);
        assert_eq!(Command::from_byte(0x66), None);
    }

    #[test]
    fn test_auth_classification() {
        assert_eq!(Command::Read.required_auth(), AuthLevel::User);
        assert_eq!(Command::Shutdown.required_auth(), AuthLevel::Admin);
        assert_eq!(Command::LoadConfig.required_auth(), AuthLevel::Admin);
        assert!(Command::Write.is_write_class());
        assert!(Command::Clean.is_write_class());
        assert!(!Command::Read.is_write_class());
        assert!(!Command::GetIds.is_write_class());
    }

    #[test]
    fn test_descriptor_decoding() {
        assert_eq!(AuthLevel::from_descriptor(0x81), AuthLevel::User);
        assert_eq!(AuthLevel::from_descriptor(0x02), AuthLevel::Admin);
        assert_eq!(ResponseType::from_descriptor(0x80), ResponseType::Ok);
        assert_eq!(ResponseType::from_descriptor(0x02), ResponseType::List);
    }
}
