//! Wire envelope and frame codec.
//!
//! The method catalog of the surrounding RPC layer is owned elsewhere; this
//! module only defines the byte-level contract the worker core serves: a
//! length-prefixed frame carrying a JSON header plus an opaque payload.
//! Matrix payloads are the flat host-contiguous byte sequences produced by
//! `DenseMatrix::to_bytes`.
//!
//! Frame layout, all lengths little-endian:
//! `[u32 header_len][header JSON][u32 payload_len][payload]`
//!
//! The codec has blocking and async halves so both scheduling variants
//! speak the identical format.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on header or payload length; anything larger is a corrupt
/// or hostile frame.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame header: {0}")]
    MalformedHeader(#[from] serde_json::Error),

    #[error("Frame segment too large: {0} bytes (limit {MAX_FRAME_BYTES})")]
    FrameTooLarge(usize),
}

/// A request the worker core can execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Register a matrix built from the frame payload.
    Store {
        id: Option<String>,
        num_rows: usize,
        num_cols: usize,
    },

    /// Serialize a matrix's authoritative values into the response payload.
    Fetch { id: String },

    /// Overwrite an existing matrix's values through its host side. Views
    /// sharing the matrix's storage observe the new values.
    Write { id: String },

    /// Materialize a matrix on the device.
    Promote { id: String },

    /// Execute a computation against registered matrices.
    Compute {
        kind: ComputeKind,
        inputs: Vec<String>,
        output: Option<String>,
    },

    /// Register a transposed view of a vector-shaped matrix.
    Transpose { id: String, output: Option<String> },

    /// Drop a matrix from the registry.
    Free { id: String },
}

/// Numeric computation kinds the worker executes itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComputeKind {
    /// Elementwise addition of two matrices.
    EwAdd,
    /// Elementwise multiplication of two matrices.
    EwMul,
    /// Multiply every element by a constant.
    Scale { factor: f64 },
}

/// Response envelope for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Stored {
        id: String,
    },
    Payload {
        id: String,
        num_rows: usize,
        num_cols: usize,
    },
    Done {
        id: String,
    },
    Freed {
        id: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Structured error categories reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OutOfDeviceMemory,
    TransferFailure,
    InvalidViewShape,
    UnknownMatrix,
    MalformedRequest,
    Cancelled,
    Internal,
}

/// One wire frame: a serialized header plus an opaque payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Bytes,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from a serializable header and payload bytes.
    pub fn new<H: Serialize>(header: &H, payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }
        let header = Bytes::from(serde_json::to_vec(header)?);
        Ok(Self { header, payload })
    }

    /// Deserialize the header.
    pub fn decode_header<'a, H: Deserialize<'a>>(&'a self) -> Result<H, ProtocolError> {
        Ok(serde_json::from_slice(&self.header)?)
    }

    /// Encode into the wire layout.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(8 + self.header.len() + self.payload.len());
        buf.put_u32_le(self.header.len() as u32);
        buf.put_slice(&self.header);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

fn check_len(len: usize) -> Result<usize, ProtocolError> {
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Read one length field; `Ok(None)` means the peer closed the connection
/// cleanly before sending any byte of it.
fn read_u32_blocking(reader: &mut impl Read) -> Result<Option<u32>, ProtocolError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )
            .into());
        }
        filled += n;
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

/// Read one frame from a blocking stream. `Ok(None)` on clean EOF at a
/// frame boundary.
pub fn read_frame_blocking(reader: &mut impl Read) -> Result<Option<Frame>, ProtocolError> {
    let Some(header_len) = read_u32_blocking(reader)? else {
        return Ok(None);
    };
    let header_len = check_len(header_len as usize)?;

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;

    let payload_len = read_u32_blocking(reader)?.ok_or_else(|| {
        ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-frame",
        ))
    })?;
    let payload_len = check_len(payload_len as usize)?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;

    Ok(Some(Frame {
        header: Bytes::from(header),
        payload: Bytes::from(payload),
    }))
}

/// Write one frame to a blocking stream.
pub fn write_frame_blocking(
    writer: &mut impl Write,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    writer.write_all(&frame.encode())?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from an async stream. `Ok(None)` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let header_len = match reader.read_u32_le().await {
        Ok(len) => check_len(len as usize)?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).await?;

    let payload_len = check_len(reader.read_u32_le().await? as usize)?;
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        header: Bytes::from(header),
        payload: Bytes::from(payload),
    }))
}

/// Write one frame to an async stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip_blocking() {
        let request = WorkerRequest::Store {
            id: Some("a".to_string()),
            num_rows: 2,
            num_cols: 2,
        };
        let payload = Bytes::from_static(&[1, 2, 3, 4]);
        let frame = Frame::new(&request, payload.clone()).unwrap();

        let wire = frame.encode();
        let mut cursor = std::io::Cursor::new(wire.to_vec());

        let decoded = read_frame_blocking(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.payload, payload);

        let header: WorkerRequest = decoded.decode_header().unwrap();
        match header {
            WorkerRequest::Store {
                id,
                num_rows,
                num_cols,
            } => {
                assert_eq!(id.as_deref(), Some("a"));
                assert_eq!((num_rows, num_cols), (2, 2));
            }
            other => panic!("unexpected header: {other:?}"),
        }

        // Stream exhausted: clean EOF.
        assert!(read_frame_blocking(&mut cursor).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_round_trip_async() {
        let response = WorkerResponse::Payload {
            id: "m".to_string(),
            num_rows: 1,
            num_cols: 3,
        };
        let frame = Frame::new(&response, Bytes::from_static(&[9, 9, 9])).unwrap();

        let mut cursor = std::io::Cursor::new(frame.encode().to_vec());
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();

        let header: WorkerResponse = decoded.decode_header().unwrap();
        assert!(matches!(header, WorkerResponse::Payload { num_cols: 3, .. }));
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let frame = Frame::new(
            &WorkerRequest::Fetch {
                id: "x".to_string(),
            },
            Bytes::new(),
        )
        .unwrap();

        let wire = frame.encode();
        let mut cursor = std::io::Cursor::new(wire[..wire.len() - 2].to_vec());
        assert!(read_frame_blocking(&mut cursor).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut cursor = std::io::Cursor::new(wire);

        assert!(matches!(
            read_frame_blocking(&mut cursor),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_request_json_shape() {
        let request = WorkerRequest::Compute {
            kind: ComputeKind::Scale { factor: 2.0 },
            inputs: vec!["a".to_string()],
            output: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""op":"compute""#));
        assert!(json.contains(r#""kind":"scale""#));
    }
}
