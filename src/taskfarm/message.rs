// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wire framing between master and workers.
//!
//! Every message is a four-word little-endian integer header
//! `[TYPE, UID, SIZE, SEQ]` followed by `SIZE` payload bytes: the
//! NUL-terminated flags string for WORK, a single double for RESULT,
//! nothing for STOP. Sequence numbers are monotonic per sender and purely
//! informational (they make interleaved logs legible).

use std::io::{Read, Write};

use crate::error::{OptError, Result};

const TYPE_WORK: i32 = 1;
const TYPE_RESULT: i32 = 2;
const TYPE_STOP: i32 = 3;

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: i32,
    pub uid: i32,
    pub size: i32,
    pub seq: i32,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Evaluate this flags string for this particle.
    Work { uid: u32, command: String },
    /// The measured fitness for the particle last handed over.
    Result { uid: u32, fitness: f64 },
    /// No more work; shut down cleanly.
    Stop,
}

/// Monotonic per-sender sequence numbers.
#[derive(Debug, Default)]
pub struct Sequence(i32);

impl Sequence {
    pub fn new() -> Sequence {
        Sequence::default()
    }

    pub fn next(&mut self) -> i32 {
        self.0 += 1;
        self.0
    }
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<()> {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes
        .chunks_exact_mut(4)
        .zip([header.msg_type, header.uid, header.size, header.seq])
    {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    writer.write_all(&bytes)?;
    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header> {
    let mut bytes = [0u8; 16];
    reader.read_exact(&mut bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            OptError::protocol("peer closed the connection mid-message".to_string())
        } else {
            OptError::from(e)
        }
    })?;
    let word = |i: usize| {
        i32::from_le_bytes([
            bytes[4 * i],
            bytes[4 * i + 1],
            bytes[4 * i + 2],
            bytes[4 * i + 3],
        ])
    };
    Ok(Header {
        msg_type: word(0),
        uid: word(1),
        size: word(2),
        seq: word(3),
    })
}

/// Send a WORK message carrying a NUL-terminated command string.
pub fn send_work(writer: &mut impl Write, seq: i32, uid: u32, command: &str) -> Result<()> {
    write_header(
        writer,
        &Header {
            msg_type: TYPE_WORK,
            uid: uid as i32,
            size: command.len() as i32 + 1,
            seq,
        },
    )?;
    writer.write_all(command.as_bytes())?;
    writer.write_all(&[0])?;
    writer.flush()?;
    Ok(())
}

/// Send a RESULT message carrying one double.
pub fn send_result(writer: &mut impl Write, seq: i32, uid: u32, fitness: f64) -> Result<()> {
    write_header(
        writer,
        &Header {
            msg_type: TYPE_RESULT,
            uid: uid as i32,
            size: 8,
            seq,
        },
    )?;
    writer.write_all(&fitness.to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Send a STOP message (header only).
pub fn send_stop(writer: &mut impl Write, seq: i32) -> Result<()> {
    write_header(
        writer,
        &Header {
            msg_type: TYPE_STOP,
            uid: 0,
            size: 0,
            seq,
        },
    )?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message, header and payload.
pub fn read_message(reader: &mut impl Read) -> Result<(Header, Message)> {
    let header = read_header(reader)?;
    let message = match header.msg_type {
        TYPE_STOP => Message::Stop,
        TYPE_WORK => {
            if header.size < 1 {
                return Err(OptError::protocol(format!(
                    "WORK message (seq #{}) has impossible payload size {}",
                    header.seq, header.size
                )));
            }
            let mut payload = vec![0u8; header.size as usize];
            reader.read_exact(&mut payload)?;
            // Strip the terminating NUL.
            payload.pop();
            let command = String::from_utf8(payload).map_err(|e| {
                OptError::protocol(format!(
                    "WORK message (seq #{}) is not valid UTF-8: {e}",
                    header.seq
                ))
            })?;
            Message::Work {
                uid: header.uid as u32,
                command,
            }
        }
        TYPE_RESULT => {
            if header.size != 8 {
                return Err(OptError::protocol(format!(
                    "RESULT message (seq #{}) has payload size {}, expected 8",
                    header.seq, header.size
                )));
            }
            let mut payload = [0u8; 8];
            reader.read_exact(&mut payload)?;
            Message::Result {
                uid: header.uid as u32,
                fitness: f64::from_le_bytes(payload),
            }
        }
        other => {
            return Err(OptError::protocol(format!(
                "unknown message type {other} (seq #{})",
                header.seq
            )))
        }
    };
    Ok((header, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn work_messages_round_trip() {
        let mut buffer = Vec::new();
        send_work(&mut buffer, 7, 3, "-funroll-loops -O2").unwrap();
        let (header, message) = read_message(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(header.seq, 7);
        assert_eq!(header.size, 19);
        assert_eq!(
            message,
            Message::Work {
                uid: 3,
                command: "-funroll-loops -O2".to_string()
            }
        );
    }

    #[test]
    fn empty_command_round_trips() {
        let mut buffer = Vec::new();
        send_work(&mut buffer, 1, 0, "").unwrap();
        let (_, message) = read_message(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(
            message,
            Message::Work {
                uid: 0,
                command: String::new()
            }
        );
    }

    #[test]
    fn result_messages_round_trip() {
        let mut buffer = Vec::new();
        send_result(&mut buffer, 2, 5, 1.001_666).unwrap();
        let (header, message) = read_message(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(header.size, 8);
        assert_eq!(
            message,
            Message::Result {
                uid: 5,
                fitness: 1.001_666
            }
        );
    }

    #[test]
    fn stop_messages_carry_no_payload() {
        let mut buffer = Vec::new();
        send_stop(&mut buffer, 9).unwrap();
        assert_eq!(buffer.len(), 16);
        let (header, message) = read_message(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(header.seq, 9);
        assert_eq!(message, Message::Stop);
    }

    #[test]
    fn messages_stream_back_to_back() {
        let mut buffer = Vec::new();
        send_work(&mut buffer, 1, 0, "a").unwrap();
        send_result(&mut buffer, 2, 0, 3.5).unwrap();
        send_stop(&mut buffer, 3).unwrap();
        let mut cursor = Cursor::new(buffer);
        assert!(matches!(
            read_message(&mut cursor).unwrap().1,
            Message::Work { .. }
        ));
        assert!(matches!(
            read_message(&mut cursor).unwrap().1,
            Message::Result { .. }
        ));
        assert_eq!(read_message(&mut cursor).unwrap().1, Message::Stop);
    }

    #[test]
    fn unknown_types_are_protocol_errors() {
        let mut buffer = Vec::new();
        write_header(
            &mut buffer,
            &Header {
                msg_type: 42,
                uid: 0,
                size: 0,
                seq: 11,
            },
        )
        .unwrap();
        let err = read_message(&mut Cursor::new(buffer)).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("#11"));
    }

    #[test]
    fn truncated_streams_are_protocol_errors() {
        let mut buffer = Vec::new();
        send_work(&mut buffer, 1, 0, "abc").unwrap();
        buffer.truncate(10);
        assert!(read_message(&mut Cursor::new(buffer)).is_err());
    }

    #[test]
    fn sequences_are_monotonic() {
        let mut seq = Sequence::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.next(), 3);
    }
}
