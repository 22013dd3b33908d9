//! Frame codec
//!
//! Every message travels as `[u32 big-endian length][bincode(Message)]`.
//! Frames are self-delimiting, so a reader can stop between messages and a
//! peeker can tell whether a complete frame is buffered.

use crate::{CommunicationError, Message, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Serialise a message into one complete frame
pub fn encode_frame(message: &Message, max_message_size: usize) -> Result<Bytes> {
    let body = bincode::serialize(message)?;
    if body.len() > max_message_size {
        return Err(CommunicationError::protocol(format!(
            "Message too large: {} bytes (max: {})",
            body.len(),
            max_message_size
        )));
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Decode the first frame of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete, otherwise the message
/// and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8], max_message_size: usize) -> Result<Option<(Message, usize)>> {
    let Some(body_len) = frame_length(buf, max_message_size)? else {
        return Ok(None);
    };

    let total = FRAME_HEADER_LEN + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let message = bincode::deserialize(&buf[FRAME_HEADER_LEN..total])?;
    Ok(Some((message, total)))
}

/// Body length announced by a buffered header, if the header is complete
pub fn frame_length(buf: &[u8], max_message_size: usize) -> Result<Option<usize>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_message_size {
        return Err(CommunicationError::protocol(format!(
            "Message too large: {} bytes (max: {})",
            len, max_message_size
        )));
    }
    Ok(Some(len))
}

/// Write one frame and flush the writer
pub fn write_frame<W: Write>(
    writer: &mut W,
    message: &Message,
    max_message_size: usize,
) -> Result<usize> {
    let frame = encode_frame(message, max_message_size)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(frame.len())
}

/// Block until one complete frame has been read
pub fn read_frame<R: Read>(reader: &mut R, max_message_size: usize) -> Result<Message> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).map_err(eof_as_closed)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max_message_size {
        return Err(CommunicationError::protocol(format!(
            "Message too large: {} bytes (max: {})",
            len, max_message_size
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(eof_as_closed)?;
    Ok(bincode::deserialize(&body)?)
}

fn eof_as_closed(error: std::io::Error) -> CommunicationError {
    if error.kind() == ErrorKind::UnexpectedEof {
        CommunicationError::connection_with_source("Connection closed by peer", None, error)
    } else {
        error.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stamped(tag: u16, data: &'static [u8], seq: i64) -> Message {
        let mut msg = Message::new(tag, Bytes::from_static(data));
        msg.set_sender_information("process", "instance", seq);
        msg
    }

    #[test]
    fn test_frame_header_is_big_endian_length() {
        let frame = encode_frame(&stamped(1, b"abc", 0), 1024).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len + FRAME_HEADER_LEN, frame.len());
    }

    #[test]
    fn test_decode_partial_frame() {
        let frame = encode_frame(&stamped(1, b"partial", 0), 1024).unwrap();

        assert!(decode_frame(&frame[..2], 1024).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1], 1024)
            .unwrap()
            .is_none());

        let (msg, used) = decode_frame(&frame, 1024).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(msg.sequence_number(), 0);
    }

    #[test]
    fn test_decode_leaves_following_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&stamped(1, b"first", 0), 1024).unwrap());
        buf.extend_from_slice(&encode_frame(&stamped(1, b"second", 1), 1024).unwrap());

        let (first, used) = decode_frame(&buf, 1024).unwrap().unwrap();
        let (second, _) = decode_frame(&buf[used..], 1024).unwrap().unwrap();
        assert_eq!(first.data().unwrap().as_ref(), b"first");
        assert_eq!(second.data().unwrap().as_ref(), b"second");
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = Message::new(1, vec![0u8; 256]);
        let err = encode_frame(&msg, 64).unwrap_err();
        assert_eq!(err.category(), "protocol");

        let frame = encode_frame(&msg, 1024).unwrap();
        assert!(decode_frame(&frame, 64).is_err());
        assert!(read_frame(&mut Cursor::new(frame.to_vec()), 64).is_err());
    }

    #[test]
    fn test_read_write_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &stamped(3, b"one", 0), 1024).unwrap();
        write_frame(&mut wire, &Message::close_communication(), 1024).unwrap();

        let mut reader = Cursor::new(wire);
        let first = read_frame(&mut reader, 1024).unwrap();
        assert_eq!(first.tag(), Some(3));
        assert!(read_frame(&mut reader, 1024)
            .unwrap()
            .is_close_communication());

        let err = read_frame(&mut reader, 1024).unwrap_err();
        assert_eq!(err.category(), "connection");
    }

    #[test]
    fn test_garbage_body_is_protocol_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&3u32.to_be_bytes());
        wire.extend_from_slice(&[0xff, 0xff, 0xff]);

        let err = read_frame(&mut Cursor::new(wire), 1024).unwrap_err();
        assert_eq!(err.category(), "protocol");
    }
}
