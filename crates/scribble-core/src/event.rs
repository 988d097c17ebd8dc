//! Draw events and board identifiers.

use scribble_protocol::{Frame, Point, StrokeStyle};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum board identifier length.
pub const MAX_BOARD_ID_LENGTH: usize = 256;

/// A board identifier.
pub type BoardId = String;

/// Validate a board identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_board_id(board: &str) -> Result<(), &'static str> {
    if board.is_empty() {
        return Err("Board id cannot be empty");
    }
    if board.len() > MAX_BOARD_ID_LENGTH {
        return Err("Board id too long");
    }
    if board.starts_with('$') {
        return Err("Board ids starting with '$' are reserved");
    }
    if !board.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Board id contains invalid characters");
    }
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One stroke segment on a board.
///
/// Events are immutable once the broadcaster has sequenced them. The serde
/// form is the persisted record layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawEvent {
    /// Board the segment belongs to.
    pub board_id: BoardId,
    /// Offset of the event in the board's log, assigned on publish.
    pub sequence: u64,
    pub from: Point,
    pub to: Point,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StrokeStyle>,
    /// Server time the event was created, in milliseconds.
    pub recorded_at: u64,
}

impl DrawEvent {
    /// Create an unsequenced event.
    #[must_use]
    pub fn new(board_id: impl Into<BoardId>, from: Point, to: Point) -> Self {
        Self {
            board_id: board_id.into(),
            sequence: 0,
            from,
            to,
            style: None,
            recorded_at: now_millis(),
        }
    }

    /// Attach a stroke style.
    #[must_use]
    pub fn with_style(mut self, style: Option<StrokeStyle>) -> Self {
        self.style = style;
        self
    }

    /// Build the wire frame that delivers this event to a client.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::Stroke {
            board: self.board_id.clone(),
            sequence: self.sequence,
            from: self.from,
            to: self.to,
            style: self.style.clone(),
        }
    }
}
