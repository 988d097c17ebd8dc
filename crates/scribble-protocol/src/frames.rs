//! Frame types for the Scribble protocol.
//!
//! A connection speaks in frames: the client joins one board, sends stroke
//! segments, and receives the segments drawn by everyone else. Each frame is
//! serialized using MessagePack.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Join = 0x01,
    Leave = 0x02,
    Draw = 0x03,
    Stroke = 0x04,
    Joined = 0x05,
    Ack = 0x06,
    Error = 0x07,
    Ping = 0x08,
    Pong = 0x09,
    Connected = 0x0A,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Join),
            0x02 => Ok(FrameType::Leave),
            0x03 => Ok(FrameType::Draw),
            0x04 => Ok(FrameType::Stroke),
            0x05 => Ok(FrameType::Joined),
            0x06 => Ok(FrameType::Ack),
            0x07 => Ok(FrameType::Error),
            0x08 => Ok(FrameType::Ping),
            0x09 => Ok(FrameType::Pong),
            0x0A => Ok(FrameType::Connected),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded or is not valid in this state.
    pub const INVALID_FRAME: u16 = 4000;
    /// The client speaks an incompatible protocol major version.
    pub const UNSUPPORTED_VERSION: u16 = 4001;
    /// The peer may not access the board.
    pub const UNAUTHORIZED: u16 = 4003;
    /// The board identifier is malformed.
    pub const INVALID_BOARD: u16 = 4004;
    /// Drawing before joining, or joining a second board.
    pub const NOT_JOINED: u16 = 4009;
    /// A board or server capacity limit was reached.
    pub const CAPACITY: u16 = 4029;
    /// Unexpected server failure.
    pub const INTERNAL: u16 = 5000;
    /// The event log could not be read or written.
    pub const STORE_UNAVAILABLE: u16 = 5003;
}

/// A point in canvas pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Optional visual attributes of a stroke segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeStyle {
    /// CSS color string, passed through untouched.
    pub color: String,
    /// Line width in pixels.
    pub thickness: f64,
}

impl StrokeStyle {
    #[must_use]
    pub fn new(color: impl Into<String>, thickness: f64) -> Self {
        Self {
            color: color.into(),
            thickness,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Join a board. Sent once per connection.
    #[serde(rename = "join")]
    Join {
        /// Request ID echoed by `joined` or `error`.
        id: u64,
        /// Board to draw on.
        board: String,
        /// Client protocol major version.
        version: u8,
        /// Optional peer identity handed to the authorization gate.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Leave the current board.
    #[serde(rename = "leave")]
    Leave {
        /// Request ID for acknowledgment.
        id: u64,
    },

    /// A stroke segment drawn by the client.
    #[serde(rename = "draw")]
    Draw {
        /// Optional request ID for acknowledgment.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        from: Point,
        to: Point,
        #[serde(skip_serializing_if = "Option::is_none")]
        style: Option<StrokeStyle>,
    },

    /// A sequenced stroke segment, replayed from history or relayed live.
    #[serde(rename = "stroke")]
    Stroke {
        board: String,
        /// Position of the segment in the board's log.
        sequence: u64,
        from: Point,
        to: Point,
        #[serde(skip_serializing_if = "Option::is_none")]
        style: Option<StrokeStyle>,
    },

    /// History replay finished; live strokes follow.
    #[serde(rename = "joined")]
    Joined {
        /// ID of the join request.
        id: u64,
        board: String,
        /// Number of strokes delivered by replay.
        replayed: u64,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Sent by the server as soon as the socket is open.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Server protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Draw { .. } => FrameType::Draw,
            Frame::Stroke { .. } => FrameType::Stroke,
            Frame::Joined { .. } => FrameType::Joined,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Create a new Join frame for the current protocol version.
    #[must_use]
    pub fn join(id: u64, board: impl Into<String>, token: Option<String>) -> Self {
        Frame::Join {
            id,
            board: board.into(),
            version: crate::PROTOCOL_VERSION.major,
            token,
        }
    }

    /// Create a new unacknowledged Draw frame.
    #[must_use]
    pub fn draw(from: Point, to: Point) -> Self {
        Frame::Draw {
            id: None,
            from,
            to,
            style: None,
        }
    }

    /// Create a new Draw frame that asks for an acknowledgment.
    #[must_use]
    pub fn draw_with_ack(id: u64, from: Point, to: Point, style: Option<StrokeStyle>) -> Self {
        Frame::Draw {
            id: Some(id),
            from,
            to,
            style,
        }
    }

    /// Create a new Joined frame.
    #[must_use]
    pub fn joined(id: u64, board: impl Into<String>, replayed: u64) -> Self {
        Frame::Joined {
            id,
            board: board.into(),
            replayed,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }
}
