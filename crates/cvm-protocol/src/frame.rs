//! Length-prefixed frames: a little-endian `u32` payload length followed by
//! the JSON encoding of one [`DockerVmMessage`].

use std::io::{self, Read, Write};

use cvm_contracts::MAX_FRAME_LEN;

use crate::DockerVmMessage;

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    TooLarge { len: usize, max: usize },
    Encode(serde_json::Error),
    Decode(serde_json::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(err) => write!(f, "frame io error: {err}"),
            FrameError::TooLarge { len, max } => {
                write!(f, "frame too large: {len} > {max} bytes")
            }
            FrameError::Encode(err) => write!(f, "frame encode error: {err}"),
            FrameError::Decode(err) => write!(f, "frame decode error: {err}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(err) => Some(err),
            FrameError::Encode(err) | FrameError::Decode(err) => Some(err),
            FrameError::TooLarge { .. } => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

pub fn write_frame(writer: &mut impl Write, msg: &DockerVmMessage) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(msg).map_err(FrameError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: MAX_FRAME_LEN,
    })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame; `Ok(None)` on a clean end of stream between frames.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<DockerVmMessage>, FrameError> {
    let mut hdr = [0u8; 4];
    if !read_exact_or_eof(reader, &mut hdr)? {
        return Ok(None);
    }
    let len = usize::try_from(u32::from_le_bytes(hdr)).unwrap_or(usize::MAX);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let msg = serde_json::from_slice(&payload).map_err(FrameError::Decode)?;
    Ok(Some(msg))
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut off = 0usize;
    while off < buf.len() {
        let n = match reader.read(&mut buf[off..]) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF inside frame header",
            ));
        }
        off += n;
    }
    Ok(true)
}
