//! Constants of the MariaDB/MySQL client-server protocol.

/// Bit flags attached to column definitions.
pub mod column_flag {
    /// Field can't be `NULL`.
    pub const NOT_NULL: u16 = 1;
    /// Field is part of a primary key.
    pub const PRIMARY_KEY: u16 = 2;
    /// Field is unsigned.
    pub const UNSIGNED: u16 = 32;
    /// Field is binary.
    pub const BINARY: u16 = 128;
    /// Field is a timestamp.
    pub const TIMESTAMP: u16 = 1024;
    /// Field is set to NOW on UPDATE.
    pub const ON_UPDATE_NOW: u16 = 8192;
    /// Field is a number.
    pub const NUM: u16 = 32768;
}

/// Column wire types.
pub mod field_type {
    #![allow(missing_docs)]
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const TIMESTAMP: u8 = 0x07;
    pub const LONG_LONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const DATE: u8 = 0x0a;
    pub const TIME: u8 = 0x0b;
    pub const DATETIME: u8 = 0x0c;
    pub const YEAR: u8 = 0x0d;
    pub const VAR_CHAR: u8 = 0x0f;
    pub const BIT: u8 = 0x10;
    pub const JSON: u8 = 0xf5;
    pub const NEW_DECIMAL: u8 = 0xf6;
    pub const ENUM: u8 = 0xf7;
    pub const SET: u8 = 0xf8;
    pub const TINY_BLOB: u8 = 0xf9;
    pub const MEDIUM_BLOB: u8 = 0xfa;
    pub const LONG_BLOB: u8 = 0xfb;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;
    pub const GEOMETRY: u8 = 0xff;
}

/// Client capability flags.
pub mod client {
    #![allow(missing_docs)]
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const LOCAL_FILES: u32 = 128;
    pub const IGNORE_SPACE: u32 = 256;
    pub const PROTOCOL_41: u32 = 512;
    pub const INTERACTIVE: u32 = 1024;
    pub const SSL: u32 = 1 << 11;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_DATA: u32 = 1 << 21;
    pub const SESSION_TRACK: u32 = 1 << 23;
    pub const DEPRECATE_EOF: u32 = 1 << 24;
}

/// Server status flags carried on OK packets.
pub mod status {
    #![allow(missing_docs)]
    pub const IN_TRANSACTION: u16 = 1;
    pub const AUTOCOMMIT: u16 = 2;
    pub const MORE_RESULTS_EXISTS: u16 = 8;
    pub const LAST_ROW_SENT: u16 = 128;
}

/// Command bytes.
pub mod com {
    /// Text-protocol query
    pub const QUERY: u8 = 0x03;
    /// Ping the server
    pub const PING: u8 = 0x0e;
    /// Terminate the session
    pub const QUIT: u8 = 0x01;
    /// Prepare a statement for the binary protocol
    pub const STMT_PREPARE: u8 = 0x16;
    /// Execute a prepared statement
    pub const STMT_EXECUTE: u8 = 0x17;
    /// Close a prepared statement (no response)
    pub const STMT_CLOSE: u8 = 0x19;
}

/// Maximum payload bytes carried by one frame; larger payloads are split.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Bound on handshake/auth exchange rounds before giving up.
pub const MAX_AUTH_ROUNDS: usize = 10;

/// utf8mb4_general_ci, the character set requested at handshake.
pub const UTF8MB4_GENERAL_CI: u8 = 45;
