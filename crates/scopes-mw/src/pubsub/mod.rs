//! Best-effort topic broadcast
//!
//! A publisher binds a local endpoint and pushes `"<topic>:<message>"`
//! frames to every subscriber connected at the time of sending. There is
//! no acknowledgement and no replay for subscribers that connect late.

mod publisher;
mod subscriber;

use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;
use scopes_wire::Marshal;

use crate::types::{MwError, Result};

pub use publisher::{Publisher, PublisherState};
pub use subscriber::{MessageCallback, Subscriber, SubscriberState};

/// Suffix of the endpoint a publisher binds, appended to its id
pub const PUBLISHER_SUFFIX: &str = "-p";

/// Largest frame a subscriber accepts
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Topics end at the first ':' of a frame, so they cannot contain one.
fn validate_topic(topic: &str) -> Result<()> {
    if topic.contains(':') {
        return Err(MwError::InvalidArgument(format!(
            "topic cannot contain ':': \"{}\"",
            topic
        )));
    }
    Ok(())
}

fn encode_frame(topic: &str, message: &str) -> Result<BytesMut> {
    validate_topic(topic)?;
    let len = topic.len() + 1 + message.len();
    if len > MAX_FRAME_SIZE {
        return Err(MwError::InvalidArgument(format!(
            "message on topic \"{}\" is {} bytes, limit is {}",
            topic, len, MAX_FRAME_SIZE
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + topic.len() + 1 + message.len());
    format!("{}:{}", topic, message).marshal(&mut buf);
    Ok(buf)
}

fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}

/// Outcome of a read that may be interrupted by a stop request
enum ReadOutcome {
    Frame(String),
    Closed,
    Stopped,
}

/// Read one frame, polling `should_stop` whenever the read times out.
///
/// A timeout in the middle of a frame keeps reading so the stream stays in
/// sync; a stop request is only honoured between frames.
fn read_frame<R: Read>(reader: &mut R, should_stop: &dyn Fn() -> bool) -> std::io::Result<ReadOutcome> {
    let mut len_buf = [0u8; 4];
    match fill(reader, &mut len_buf, Some(should_stop))? {
        Some(true) => {}
        Some(false) => return Ok(ReadOutcome::Closed),
        None => return Ok(ReadOutcome::Stopped),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
        ));
    }
    let mut body = vec![0u8; len];
    if fill(reader, &mut body, None)? != Some(true) {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    String::from_utf8(body)
        .map(ReadOutcome::Frame)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}

/// Fill `buf`. Returns `Some(true)` when full, `Some(false)` on EOF before
/// the first byte and `None` if a stop was requested before the first byte.
fn fill<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    should_stop: Option<&dyn Fn() -> bool>,
) -> std::io::Result<Option<bool>> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(Some(false)),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if filled == 0 && should_stop.is_some_and(|stop| stop()) {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(true))
}

/// Split a frame into its message if it carries `topic`.
///
/// An empty topic matches every frame.
fn match_topic<'a>(frame: &'a str, topic: &str) -> Option<&'a str> {
    let (frame_topic, message) = frame.split_once(':')?;
    (topic.is_empty() || frame_topic == topic).then_some(message)
}
