//! TCP 프레임 코덱
//!
//! ```text
//! magic(4, LE) | version(1) | payload_len(4, LE) | bincode body
//! ```
//!
//! 매직/버전 불일치나 최대 크기 초과는 연결을 끊어야 하는 오류다.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 프레임 헤더 크기
pub const FRAME_HEADER_LEN: usize = 9;

/// 메시지를 프레임 바이트로 인코딩
pub fn encode_frame<T: Serialize>(message: &T, max_len: usize) -> Result<Bytes> {
    let body = bincode::serialize(message)?;
    if body.len() > max_len {
        return Err(Error::FrameTooLarge {
            len: body.len(),
            max: max_len,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u32_le(MAGIC_NUMBER);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u32_le(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// 헤더 검증 후 본문 길이 반환
pub fn decode_header(header: &[u8; FRAME_HEADER_LEN], max_len: usize) -> Result<usize> {
    let mut cursor = &header[..];
    let magic = cursor.get_u32_le();
    if magic != MAGIC_NUMBER {
        return Err(Error::InvalidMagicNumber {
            expected: MAGIC_NUMBER,
            got: magic,
        });
    }

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(Error::InvalidVersion {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }

    let len = cursor.get_u32_le() as usize;
    if len > max_len {
        return Err(Error::FrameTooLarge { len, max: max_len });
    }
    Ok(len)
}

/// 프레임 하나 읽기
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_exact(reader, &mut header).await?;
    let len = decode_header(&header, max_len)?;

    let mut body = vec![0u8; len];
    read_exact(reader, &mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// 프레임 하나 쓰기
pub async fn write_frame<W, T>(writer: &mut W, message: &T, max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message, max_len)?;
    writer.write_all(&frame).await?;
    Ok(())
}
