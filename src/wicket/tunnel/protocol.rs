//! Line-oriented control messages for the rendezvous tunnel.
//!
//! Every message is one ASCII line terminated by `\n`, no length prefixes.
//! The first line written on a rendezvous connection declares its role
//! (`control` or `data:<connID>`); the control link then carries tagged
//! `dial:`/`done:` request/response pairs, and each data link is acked with
//! a single `ok` before payload flows.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single wire line. Large enough for any
/// `dial:<seq>:<host>:<port>` with a DNS name; anything bigger is a broken
/// or hostile peer.
pub const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,
    #[error("line is not valid utf-8")]
    BadEncoding,
    #[error("unknown message {0:?}")]
    UnknownMessage(String),
    #[error("bad number in {0:?}")]
    BadNumber(String),
    #[error("empty dial target")]
    EmptyTarget,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// A complete-but-malformed line. The relay's control loop skips these
    /// and keeps reading; anything else kills the link.
    pub fn is_malformed_line(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadEncoding
                | ProtocolError::UnknownMessage(_)
                | ProtocolError::BadNumber(_)
                | ProtocolError::EmptyTarget
        )
    }
}

/// Role announced by the first line on a rendezvous connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// This connection is (or replaces) the control link.
    Control,
    /// This connection carries the payload of exactly one tunnel.
    Data { conn_id: u32 },
}

/// `dial:<seq>:<address>`, gateway -> relay over the control link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub seq: u32,
    pub target: String,
}

/// `done:<seq>:<connID>`, relay -> gateway over the control link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialResponse {
    pub seq: u32,
    pub conn_id: u32,
}

pub async fn write_link_role<W: AsyncWrite + Unpin>(
    w: &mut W,
    role: LinkRole,
) -> Result<(), ProtocolError> {
    let line = match role {
        LinkRole::Control => "control\n".to_string(),
        LinkRole::Data { conn_id } => format!("data:{conn_id}\n"),
    };
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_link_role<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<LinkRole, ProtocolError> {
    let line = read_line(r).await?;
    if line == "control" {
        return Ok(LinkRole::Control);
    }
    if let Some(rest) = line.strip_prefix("data:") {
        let conn_id = rest
            .parse::<u32>()
            .map_err(|_| ProtocolError::BadNumber(line.clone()))?;
        return Ok(LinkRole::Data { conn_id });
    }
    Err(ProtocolError::UnknownMessage(line))
}

pub async fn write_dial_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &DialRequest,
) -> Result<(), ProtocolError> {
    if req.target.trim().is_empty() {
        return Err(ProtocolError::EmptyTarget);
    }
    let line = format!("dial:{}:{}\n", req.seq, req.target.trim());
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_dial_request<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<DialRequest, ProtocolError> {
    let line = read_line(r).await?;
    let Some(rest) = line.strip_prefix("dial:") else {
        return Err(ProtocolError::UnknownMessage(line));
    };
    // Targets contain ':' themselves (host:port), so only split once.
    let Some((seq, target)) = rest.split_once(':') else {
        return Err(ProtocolError::UnknownMessage(line));
    };
    let seq = seq
        .parse::<u32>()
        .map_err(|_| ProtocolError::BadNumber(line.clone()))?;
    let target = target.trim();
    if target.is_empty() {
        return Err(ProtocolError::EmptyTarget);
    }
    Ok(DialRequest {
        seq,
        target: target.to_string(),
    })
}

pub async fn write_dial_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    rsp: DialResponse,
) -> Result<(), ProtocolError> {
    let line = format!("done:{}:{}\n", rsp.seq, rsp.conn_id);
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_dial_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<DialResponse, ProtocolError> {
    let line = read_line(r).await?;
    let Some(rest) = line.strip_prefix("done:") else {
        return Err(ProtocolError::UnknownMessage(line));
    };
    let Some((seq, conn_id)) = rest.split_once(':') else {
        return Err(ProtocolError::UnknownMessage(line));
    };
    let seq = seq
        .parse::<u32>()
        .map_err(|_| ProtocolError::BadNumber(line.clone()))?;
    let conn_id = conn_id
        .parse::<u32>()
        .map_err(|_| ProtocolError::BadNumber(line.clone()))?;
    Ok(DialResponse { seq, conn_id })
}

pub async fn write_ack<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    w.write_all(b"ok\n").await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_ack<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    let line = read_line(r).await?;
    if line != "ok" {
        return Err(ProtocolError::UnknownMessage(line));
    }
    Ok(())
}

/// Read one `\n`-terminated line, bounded by [`MAX_LINE_BYTES`]. EOF before
/// the terminator is a hard error; a trailing `\r` is tolerated.
async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let mut buf = Vec::new();
    let mut limited = r.take((MAX_LINE_BYTES + 1) as u64);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(ProtocolError::UnexpectedEof);
    }
    if buf.last() != Some(&b'\n') {
        if n > MAX_LINE_BYTES {
            return Err(ProtocolError::LineTooLong);
        }
        return Err(ProtocolError::UnexpectedEof);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::BadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader, duplex};

    #[tokio::test]
    async fn dial_request_roundtrip() {
        let (mut a, b) = duplex(256);
        let req = DialRequest {
            seq: 7,
            target: "example.org:80".into(),
        };
        write_dial_request(&mut a, &req).await.unwrap();

        let mut r = BufReader::new(b);
        let got = read_dial_request(&mut r).await.unwrap();
        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn dial_request_target_keeps_every_colon() {
        let (mut a, b) = duplex(256);
        let req = DialRequest {
            seq: 1,
            target: "[::1]:8080".into(),
        };
        write_dial_request(&mut a, &req).await.unwrap();

        let mut r = BufReader::new(b);
        let got = read_dial_request(&mut r).await.unwrap();
        assert_eq!(got.target, "[::1]:8080");
    }

    #[tokio::test]
    async fn dial_response_roundtrip() {
        let (mut a, b) = duplex(64);
        write_dial_response(&mut a, DialResponse { seq: 3, conn_id: 12 })
            .await
            .unwrap();

        let mut r = BufReader::new(b);
        let got = read_dial_response(&mut r).await.unwrap();
        assert_eq!(got, DialResponse { seq: 3, conn_id: 12 });
    }

    #[tokio::test]
    async fn link_role_roundtrip() {
        let (mut a, b) = duplex(64);
        write_link_role(&mut a, LinkRole::Control).await.unwrap();
        write_link_role(&mut a, LinkRole::Data { conn_id: 42 })
            .await
            .unwrap();

        let mut r = BufReader::new(b);
        assert_eq!(read_link_role(&mut r).await.unwrap(), LinkRole::Control);
        assert_eq!(
            read_link_role(&mut r).await.unwrap(),
            LinkRole::Data { conn_id: 42 }
        );
    }

    #[tokio::test]
    async fn ack_roundtrip_and_mismatch() {
        let (mut a, b) = duplex(64);
        write_ack(&mut a).await.unwrap();
        a.write_all(b"nope\n").await.unwrap();

        let mut r = BufReader::new(b);
        read_ack(&mut r).await.unwrap();
        let err = read_ack(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(m) if m == "nope"));
    }

    #[tokio::test]
    async fn non_numeric_id_is_rejected() {
        let (mut a, b) = duplex(64);
        a.write_all(b"data:abc\n").await.unwrap();

        let mut r = BufReader::new(b);
        let err = read_link_role(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadNumber(_)));
        assert!(err.is_malformed_line());
    }

    #[tokio::test]
    async fn empty_dial_target_is_rejected() {
        let (mut a, b) = duplex(64);
        a.write_all(b"dial:5:\n").await.unwrap();

        let mut r = BufReader::new(b);
        let err = read_dial_request(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyTarget));
    }

    #[tokio::test]
    async fn premature_eof_fails_the_read() {
        let (mut a, b) = duplex(64);
        a.write_all(b"dial:5:exam").await.unwrap();
        drop(a);

        let mut r = BufReader::new(b);
        let err = read_dial_request(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
        assert!(!err.is_malformed_line());
    }

    #[tokio::test]
    async fn overlong_line_is_rejected_without_buffering_it_all() {
        let (mut a, b) = duplex(MAX_LINE_BYTES * 2 + 64);
        let big = vec![b'x'; MAX_LINE_BYTES + 16];
        a.write_all(b"dial:1:").await.unwrap();
        a.write_all(&big).await.unwrap();
        a.write_all(b"\n").await.unwrap();

        let mut r = BufReader::new(b);
        let err = read_dial_request(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong));
    }
}
