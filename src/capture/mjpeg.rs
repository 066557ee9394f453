//! MJPEG over HTTP (`multipart/x-mixed-replace`), as served by most IP
//! cameras on their `http://` endpoints.
//!
//! The multipart boundaries are not parsed; frames are cut out of the byte
//! stream at JPEG start/end markers, which also copes with cameras that send
//! broken part headers. Chunked response bodies are decoded first so chunk
//! framing never lands inside a frame.
//!
//! A JPEG carrying an embedded EXIF thumbnail has an end marker inside the
//! thumbnail; such a frame is cut short at that marker and fails to decode.
//! Camera MJPEG streams do not embed thumbnails in practice.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};
use url::Url;

use crate::capture::frame::{FrameMetadata, PixelFormat};
use crate::capture::source::{Connection, Connector};
use crate::capture::Frame;
use crate::error::CaptureError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

pub struct MjpegConnector {
    max_frame_bytes: usize,
}

impl MjpegConnector {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

#[async_trait]
impl Connector for MjpegConnector {
    #[instrument(skip(self), fields(url = %url))]
    async fn connect(&self, url: &Url) -> Result<Box<dyn Connection>, CaptureError> {
        let host = url
            .host_str()
            .ok_or_else(|| CaptureError::connection(url.as_str(), "missing host"))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| CaptureError::connection(url.as_str(), e))?;
        stream
            .write_all(request(url, host).as_bytes())
            .await
            .map_err(|e| CaptureError::connection(url.as_str(), e))?;

        let mut raw = BytesMut::with_capacity(64 * 1024);
        let header_end = loop {
            if let Some(pos) = find(&raw, b"\r\n\r\n") {
                break pos;
            }
            if raw.len() > MAX_HEADER_BYTES {
                return Err(CaptureError::connection(url.as_str(), "response header too large"));
            }
            let n = stream
                .read_buf(&mut raw)
                .await
                .map_err(|e| CaptureError::connection(url.as_str(), e))?;
            if n == 0 {
                return Err(CaptureError::connection(
                    url.as_str(),
                    "connection closed before response header",
                ));
            }
        };

        let header = String::from_utf8_lossy(&raw[..header_end]).into_owned();
        let status = header.lines().next().unwrap_or_default();
        if status.split_whitespace().nth(1) != Some("200") {
            return Err(CaptureError::connection(
                url.as_str(),
                format!("unexpected response '{status}'"),
            ));
        }
        let chunked = is_chunked(&header);
        debug!(url = %url, status, chunked, "mjpeg stream opened");
        raw.advance(header_end + 4);

        Ok(Box::new(MjpegConnection {
            stream,
            raw,
            chunked: chunked.then(Dechunker::default),
            frames: JpegSplitter::default(),
            max_frame_bytes: self.max_frame_bytes,
        }))
    }
}

fn request(url: &Url, host: &str) -> String {
    let path = &url[url::Position::BeforePath..url::Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: vigil/{}\r\n\
         Accept: multipart/x-mixed-replace, image/jpeg\r\n\
         Connection: close\r\n\r\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn is_chunked(header: &str) -> bool {
    header
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        })
}

struct MjpegConnection {
    stream: TcpStream,
    /// Body bytes as received, before chunk decoding
    raw: BytesMut,
    chunked: Option<Dechunker>,
    frames: JpegSplitter,
    max_frame_bytes: usize,
}

#[async_trait]
impl Connection for MjpegConnection {
    async fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        loop {
            match &mut self.chunked {
                Some(dechunker) => dechunker.feed(&mut self.raw, &mut self.frames)?,
                None => {
                    self.frames.extend(&self.raw);
                    self.raw.clear();
                }
            }
            if let Some(jpeg) = self.frames.next_frame() {
                return Ok(Frame::new(
                    jpeg,
                    FrameMetadata {
                        sequence: 0,
                        width: 0,
                        height: 0,
                        format: PixelFormat::Mjpeg,
                    },
                ));
            }
            if self.frames.len() > self.max_frame_bytes {
                return Err(CaptureError::read(format!(
                    "no complete frame within {} bytes",
                    self.max_frame_bytes
                )));
            }
            if self.chunked.as_ref().is_some_and(Dechunker::is_done) {
                return Err(CaptureError::read("chunked stream ended"));
            }
            let n = self
                .stream
                .read_buf(&mut self.raw)
                .await
                .map_err(CaptureError::read)?;
            if n == 0 {
                return Err(CaptureError::read("stream closed by peer"));
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Cuts complete JPEGs out of a byte stream.
///
/// Bytes before a start marker are discarded. The end-marker search resumes
/// where the previous call stopped, so each byte is scanned once however the
/// frame is fragmented.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: BytesMut,
    /// `buf` begins with a start marker
    started: bool,
    /// Prefix of `buf` already searched for the end marker
    scanned: usize,
}

impl JpegSplitter {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held, including a partial frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The next complete JPEG, or `None` until its end marker has arrived.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if !self.started {
            let Some(start) = find(&self.buf, &SOI) else {
                // A trailing 0xFF may be the first half of the next start marker.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let len = self.buf.len();
                self.buf.advance(len - keep);
                return None;
            };
            self.buf.advance(start);
            self.started = true;
            self.scanned = SOI.len();
        }

        // Back up one byte: the marker may straddle the previous scan end.
        let from = self.scanned.saturating_sub(1).max(SOI.len());
        match find(&self.buf[from..], &EOI) {
            Some(pos) => {
                let end = from + pos + EOI.len();
                self.started = false;
                self.scanned = 0;
                Some(self.buf.split_to(end).freeze())
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ChunkState {
    #[default]
    Size,
    Data(usize),
    /// CRLF after a chunk's data
    DataEnd,
    /// Zero-size chunk seen; trailers are ignored
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
#[derive(Debug, Default)]
struct Dechunker {
    state: ChunkState,
}

impl Dechunker {
    /// Move decoded body bytes from `raw` into `out`. Incomplete chunk framing
    /// stays in `raw` for the next call.
    fn feed(&mut self, raw: &mut BytesMut, out: &mut JpegSplitter) -> Result<(), CaptureError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(eol) = find(raw, b"\r\n") else {
                        if raw.len() > MAX_CHUNK_LINE {
                            return Err(CaptureError::read("chunk size line too long"));
                        }
                        return Ok(());
                    };
                    let line = &raw[..eol];
                    let digits = line.split(|b| *b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(digits)
                        .ok()
                        .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
                        .ok_or_else(|| {
                            CaptureError::read(format!(
                                "bad chunk size '{}'",
                                String::from_utf8_lossy(line)
                            ))
                        })?;
                    raw.advance(eol + 2);
                    self.state = match size {
                        0 => ChunkState::Done,
                        n => ChunkState::Data(n),
                    };
                }
                ChunkState::Data(remaining) => {
                    if raw.is_empty() {
                        return Ok(());
                    }
                    let n = remaining.min(raw.len());
                    out.extend(&raw[..n]);
                    raw.advance(n);
                    self.state = match remaining - n {
                        0 => ChunkState::DataEnd,
                        left => ChunkState::Data(left),
                    };
                }
                ChunkState::DataEnd => {
                    if raw.len() < 2 {
                        return Ok(());
                    }
                    if raw[..2] != *b"\r\n" {
                        return Err(CaptureError::read("chunk data not followed by CRLF"));
                    }
                    raw.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Done => {
                    raw.clear();
                    return Ok(());
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tokio::net::TcpListener;

    fn jpeg(shade: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 8, Rgb([shade, shade, shade]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn part(jpeg: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .into_bytes();
        out.extend_from_slice(jpeg);
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Chunk-encode `parts`, splitting each one in two at its midpoint.
    fn chunked(parts: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for part in parts {
            let (a, b) = part.split_at(part.len() / 2);
            for piece in [a, b] {
                out.extend(format!("{:x}\r\n", piece.len()).into_bytes());
                out.extend_from_slice(piece);
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    fn splitter(data: &[u8]) -> JpegSplitter {
        let mut s = JpegSplitter::default();
        s.extend(data);
        s
    }

    #[test]
    fn test_splitter_skips_part_headers() {
        let first = jpeg(10);
        let second = jpeg(200);
        let mut s = splitter(&part(&first));
        s.extend(&part(&second));

        assert_eq!(s.next_frame().as_deref(), Some(&first[..]));
        assert_eq!(s.next_frame().as_deref(), Some(&second[..]));
        assert_eq!(s.next_frame(), None);
    }

    #[test]
    fn test_splitter_waits_for_end_marker() {
        let img = jpeg(99);
        let mut s = splitter(&img[..img.len() - 1]);
        assert_eq!(s.next_frame(), None);
        assert_eq!(s.len(), img.len() - 1);
        s.extend(&img[img.len() - 1..]);
        assert_eq!(s.next_frame().as_deref(), Some(&img[..]));
        assert!(s.is_empty());
    }

    #[test]
    fn test_splitter_keeps_split_start_marker() {
        let mut s = splitter(b"garbage\xFF");
        assert_eq!(s.next_frame(), None);
        assert_eq!(s.len(), 1);

        let mut s = splitter(b"garbage");
        assert_eq!(s.next_frame(), None);
        assert!(s.is_empty());
    }

    #[test]
    fn test_splitter_byte_at_a_time() {
        let first = jpeg(40);
        let second = jpeg(180);
        let mut stream = part(&first);
        stream.extend(part(&second));

        let mut s = JpegSplitter::default();
        let mut frames = Vec::new();
        for byte in &stream {
            s.extend(std::slice::from_ref(byte));
            frames.extend(s.next_frame());
        }
        assert_eq!(frames, vec![Bytes::from(first), Bytes::from(second)]);
    }

    #[test]
    fn test_dechunk_across_reads() {
        let body = b"hello, camera".to_vec();
        let encoded = b"5;name=value\r\nhello\r\n8\r\n, camera\r\n0\r\n\r\n";

        let mut d = Dechunker::default();
        let mut out = JpegSplitter::default();
        let mut raw = BytesMut::new();
        for piece in encoded.chunks(3) {
            raw.extend_from_slice(piece);
            d.feed(&mut raw, &mut out).unwrap();
        }
        assert!(d.is_done());
        assert_eq!(&out.buf[..], &body[..]);
    }

    #[test]
    fn test_dechunk_rejects_bad_framing() {
        let mut out = JpegSplitter::default();
        let mut raw = BytesMut::from(&b"zz\r\n"[..]);
        assert!(Dechunker::default().feed(&mut raw, &mut out).is_err());

        let mut raw = BytesMut::from(&b"2\r\nabXY"[..]);
        let err = Dechunker::default().feed(&mut raw, &mut out).unwrap_err();
        assert!(err.to_string().contains("CRLF"));

        let mut raw = BytesMut::from(&vec![b'1'; MAX_CHUNK_LINE + 1][..]);
        assert!(Dechunker::default().feed(&mut raw, &mut out).is_err());
    }

    #[test]
    fn test_chunked_header_detection() {
        assert!(is_chunked("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked"));
        assert!(is_chunked("HTTP/1.1 200 OK\r\ntransfer-encoding:  gzip, Chunked"));
        assert!(!is_chunked("HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace"));
    }

    #[test]
    fn test_request_line() {
        let url = Url::parse("http://singapore:9081/video?fps=10").unwrap();
        let req = request(&url, "singapore");
        assert!(req.starts_with("GET /video?fps=10 HTTP/1.1\r\n"));
        assert!(req.contains("Host: singapore:9081\r\n"));

        let url = Url::parse("http://cam.local").unwrap();
        assert!(request(&url, "cam.local").starts_with("GET / HTTP/1.1\r\n"));
    }

    async fn serve(response: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.ok();
        });
        Url::parse(&format!("http://{addr}/stream")).unwrap()
    }

    #[tokio::test]
    async fn test_reads_frames_from_http_server() {
        let first = jpeg(30);
        let second = jpeg(60);
        let mut response = b"HTTP/1.1 200 OK\r\n\
            Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\r\n"
            .to_vec();
        response.extend(part(&first));
        response.extend(part(&second));
        let url = serve(response).await;

        let mut conn = MjpegConnector::new(1 << 20).connect(&url).await.unwrap();
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(frame.meta.format, PixelFormat::Mjpeg);
        assert_eq!(&frame.data[..], &first[..]);
        assert_eq!(&conn.read_frame().await.unwrap().data[..], &second[..]);

        let err = conn.read_frame().await.unwrap_err();
        assert!(matches!(err, CaptureError::Read(_)));
    }

    #[tokio::test]
    async fn test_reads_chunked_frames_from_http_server() {
        let first = jpeg(30);
        let second = jpeg(220);
        let mut response = b"HTTP/1.1 200 OK\r\n\
            Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
            Transfer-Encoding: chunked\r\n\r\n"
            .to_vec();
        response.extend(chunked(&[part(&first), part(&second)]));
        let url = serve(response).await;

        let mut conn = MjpegConnector::new(1 << 20).connect(&url).await.unwrap();
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(&frame.data[..], &first[..]);
        assert!(image::load_from_memory(&frame.data).is_ok());
        assert_eq!(&conn.read_frame().await.unwrap().data[..], &second[..]);

        let err = conn.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("chunked stream ended"));
    }

    #[tokio::test]
    async fn test_non_200_is_connection_error() {
        let url = serve(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()).await;
        let err = MjpegConnector::new(1 << 20).connect(&url).await.err().unwrap();
        assert!(matches!(err, CaptureError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_read_error() {
        let mut response = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        response.extend_from_slice(&SOI);
        response.extend(std::iter::repeat(0u8).take(4096));
        let url = serve(response).await;

        let mut conn = MjpegConnector::new(1024).connect(&url).await.unwrap();
        let err = conn.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("no complete frame"));
    }
}
