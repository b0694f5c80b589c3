//! Content-Lengthヘッダによるメッセージのフレーミング
//!
//! ```text
//! Content-Length: 38\r\n
//! \r\n
//! {"command":"set_bp","params":{"addr":16}}
//! ```

use crate::{Message, TransportError};
use std::io::{BufRead, Write};

/// 1フレームの上限。これを超える長さは壊れたストリームとみなす
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// メッセージをフレームとして書き込む
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// フレームを1つ読み、本文のバイト列を返す
///
/// ヘッダの途中を含め、ストリームの終端は `Closed` になります。
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(TransportError::Closed);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            let len = v
                .trim()
                .parse()
                .map_err(|e| TransportError::Framing(format!("bad Content-Length '{}': {}", v.trim(), e)))?;
            content_length = Some(len);
        }
    }

    let len = content_length
        .ok_or_else(|| TransportError::Framing("missing Content-Length header".to_string()))?;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Framing(format!("frame of {} bytes is too large", len)));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => TransportError::Io(e),
    })?;
    Ok(buf)
}

/// フレーム本文をメッセージにデコードする
pub fn decode(payload: &[u8]) -> Result<Message, TransportError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_are_read_in_order() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Message::SetBp { addr: 0x10 }).unwrap();
        write_frame(&mut wire, &Message::Go).unwrap();

        let mut reader = Cursor::new(wire);
        let first = decode(&read_frame(&mut reader).unwrap()).unwrap();
        let second = decode(&read_frame(&mut reader).unwrap()).unwrap();
        assert_eq!(first, Message::SetBp { addr: 0x10 });
        assert_eq!(second, Message::Go);
        assert!(matches!(read_frame(&mut reader), Err(TransportError::Closed)));
    }

    #[test]
    fn test_truncated_body_is_closed() {
        let mut reader = Cursor::new(b"Content-Length: 40\r\n\r\n{\"command\"".to_vec());
        assert!(matches!(read_frame(&mut reader), Err(TransportError::Closed)));
    }

    #[test]
    fn test_missing_header_is_framing_error() {
        let mut reader = Cursor::new(b"X-Other: 1\r\n\r\n{}".to_vec());
        assert!(matches!(read_frame(&mut reader), Err(TransportError::Framing(_))));
    }

    #[test]
    fn test_malformed_body_is_codec_error() {
        assert!(matches!(decode(b"{\"command\": 3}"), Err(TransportError::Codec(_))));
    }
}
