//! # scribble-protocol
//!
//! Wire protocol for the Scribble shared-whiteboard engine.
//!
//! ## Frame Types
//!
//! - `Join` / `Leave` / `Joined` - Board membership and the end of replay
//! - `Draw` / `Stroke` - Segments sent by a client and relayed by the server
//! - `Ack` / `Error` - Acknowledgments and errors
//! - `Ping` / `Pong` / `Connected` - Connection housekeeping
//!
//! ## Example
//!
//! ```rust
//! use scribble_protocol::{codec, Frame, Point};
//!
//! let frame = Frame::draw(Point::new(0.0, 0.0), Point::new(10.0, 10.0));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType, Point, StrokeStyle};
pub use version::{Version, PROTOCOL_VERSION};
