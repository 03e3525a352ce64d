//! STOMP frame codec
//!
//! Frames are `COMMAND EOL *(header EOL) EOL body NUL`. The decoder is
//! streaming: a transport message may carry several frames, part of one, or
//! only heart-beat EOLs.

use std::fmt;

/// STOMP commands, client and server side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    /// CONNECT and CONNECTED headers are never escaped (STOMP 1.2)
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("header line without ':': {0:?}")]
    InvalidHeader(String),

    #[error("invalid escape sequence in header: {0:?}")]
    InvalidEscape(String),

    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    #[error("frame body not terminated by NUL")]
    MissingTerminator,

    #[error("frame headers are not valid UTF-8")]
    NotUtf8,

    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// One STOMP frame. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Lookups return the first occurrence.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.get("destination")
    }

    pub fn receipt(&self) -> Option<&str> {
        self.get("receipt")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Server `CONNECTED` reply
    pub fn connected(version: &str, heart_beat: (u64, u64)) -> Self {
        Frame::new(Command::Connected)
            .header("version", version)
            .header("heart-beat", format!("{},{}", heart_beat.0, heart_beat.1))
            .header("server", concat!("parley/", env!("CARGO_PKG_VERSION")))
    }

    pub fn receipt_for(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).header("receipt-id", receipt_id)
    }

    /// `ERROR` frame with a short `message` header and a longer text body
    pub fn error(message: &str, detail: &str) -> Self {
        Frame::new(Command::Error)
            .header("message", message)
            .header("content-type", "text/plain")
            .header("content-length", detail.len().to_string())
            .with_body(detail)
    }

    /// Wire encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        let escape = self.command.escapes_headers();
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

}

pub fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// Incremental decoder over a byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    /// Skipping the remainder of a rejected frame
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered towards an incomplete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Push `chunk` and drain every frame it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Frame, FrameError>> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Next complete frame, or `None` until more bytes arrive.
    ///
    /// A malformed frame yields one `Err` and decoding resumes after its NUL.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.discarding {
            match self.buf.iter().position(|&b| b == 0) {
                Some(pos) => {
                    self.buf.drain(..=pos);
                    self.discarding = false;
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }
        }

        self.skip_heartbeats();
        if self.buf.is_empty() {
            return None;
        }

        let Some((head_end, body_start)) = find_header_end(&self.buf) else {
            if self.buf.len() > self.max_frame_bytes {
                return Some(self.reject(FrameError::TooLarge {
                    limit: self.max_frame_bytes,
                }));
            }
            return None;
        };

        let (command, headers) = match parse_head(&self.buf[..head_end]) {
            Ok(head) => head,
            Err(e) => return Some(self.reject(e)),
        };

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(value.clone()))
            })
            .transpose();

        let body_end = match content_length {
            Err(e) => return Some(self.reject(e)),
            Ok(Some(len)) => {
                let end = match body_start.checked_add(len) {
                    Some(end) if end < self.max_frame_bytes => end,
                    _ => {
                        return Some(self.reject(FrameError::TooLarge {
                            limit: self.max_frame_bytes,
                        }))
                    }
                };
                if self.buf.len() <= end {
                    return None;
                }
                if self.buf[end] != 0 {
                    return Some(self.reject(FrameError::MissingTerminator));
                }
                end
            }
            Ok(None) => match self.buf[body_start..].iter().position(|&b| b == 0) {
                Some(offset) => body_start + offset,
                None => {
                    if self.buf.len() > self.max_frame_bytes {
                        return Some(self.reject(FrameError::TooLarge {
                            limit: self.max_frame_bytes,
                        }));
                    }
                    return None;
                }
            },
        };

        if body_end + 1 > self.max_frame_bytes {
            self.buf.drain(..=body_end);
            return Some(Err(FrameError::TooLarge {
                limit: self.max_frame_bytes,
            }));
        }

        let body = self.buf[body_start..body_end].to_vec();
        self.buf.drain(..=body_end);

        Some(Ok(Frame {
            command,
            headers,
            body,
        }))
    }

    fn skip_heartbeats(&mut self) {
        let mut skip = 0;
        loop {
            match &self.buf[skip..] {
                [b'\n', ..] => skip += 1,
                [b'\r', b'\n', ..] => skip += 2,
                _ => break,
            }
        }
        self.buf.drain(..skip);
    }

    /// Drop the current frame up to its NUL, or everything until one shows up
    fn reject(&mut self, err: FrameError) -> Result<Frame, FrameError> {
        match self.buf.iter().position(|&b| b == 0) {
            Some(pos) => {
                self.buf.drain(..=pos);
            }
            None => {
                self.buf.clear();
                self.discarding = true;
            }
        }
        Err(err)
    }
}

/// End of the header block and start of the body
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while let Some(offset) = buf[i..].iter().position(|&b| b == b'\n') {
        let nl = i + offset;
        match &buf[nl + 1..] {
            [b'\n', ..] => return Some((nl, nl + 2)),
            [b'\r', b'\n', ..] => return Some((nl, nl + 3)),
            _ => i = nl + 1,
        }
    }
    None
}

fn parse_head(head: &[u8]) -> Result<(Command, Vec<(String, String)>), FrameError> {
    let head = std::str::from_utf8(head).map_err(|_| FrameError::NotUtf8)?;
    let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

    let command_line = lines.next().unwrap_or_default();
    let command = Command::parse(command_line)
        .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::InvalidHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok((command, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Result<Frame, FrameError>> {
        FrameDecoder::new(1024).decode(input)
    }

    #[test]
    fn test_decode_send() {
        let frames = decode_all(b"SEND\ndestination:/app/chat\ncontent-type:application/json\n\n{\"text\":\"hi\"}\0");
        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.command, Command::Send);
        assert_eq!(frame.destination(), Some("/app/chat"));
        assert_eq!(frame.content_type(), Some("application/json"));
        assert_eq!(frame.body_str(), Some("{\"text\":\"hi\"}"));
    }

    #[test]
    fn test_crlf_and_heartbeats() {
        let frames = decode_all(b"\n\r\n\nSUBSCRIBE\r\nid:sub-0\r\ndestination:/topic/messages\r\n\r\n\0\n\n");
        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.command, Command::Subscribe);
        assert_eq!(frame.get("id"), Some("sub-0"));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = FrameDecoder::new(1024);
        assert!(decoder.decode(b"SEND\ndestina").is_empty());
        assert!(decoder.decode(b"tion:/topic/a\n\nhel").is_empty());
        let frames = decoder.decode(b"lo\0SEND\ndestination:/topic/b\n\n\0");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().body_str(), Some("hello"));
        assert_eq!(frames[1].as_ref().unwrap().destination(), Some("/topic/b"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let frames = decode_all(b"SEND\ndestination:/topic/a\ncontent-length:3\n\na\0b\0");
        assert_eq!(frames[0].as_ref().unwrap().body, b"a\0b");
    }

    #[test]
    fn test_content_length_waits_for_body() {
        let mut decoder = FrameDecoder::new(1024);
        assert!(decoder.decode(b"SEND\ncontent-length:5\n\nab\0").is_empty());
        let frames = decoder.decode(b"de\0");
        assert_eq!(frames[0].as_ref().unwrap().body, b"ab\0de");
    }

    #[test]
    fn test_first_header_wins() {
        let frames = decode_all(b"SEND\ndestination:/topic/a\ndestination:/topic/b\n\n\0");
        assert_eq!(frames[0].as_ref().unwrap().destination(), Some("/topic/a"));
    }

    #[test]
    fn test_header_escaping() {
        let frame = Frame::new(Command::Message)
            .header("note", "a:b\nc\\d")
            .with_body("x");
        let encoded = frame.encode();
        assert!(std::str::from_utf8(&encoded).unwrap().contains("note:a\\cb\\nc\\\\d\n"));

        let decoded = decode_all(&encoded).remove(0).unwrap();
        assert_eq!(decoded.get("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn test_connect_headers_not_unescaped() {
        let frames = decode_all(b"CONNECT\nlogin:a\\cb\n\n\0");
        assert_eq!(frames[0].as_ref().unwrap().get("login"), Some("a\\cb"));
    }

    #[test]
    fn test_bad_frame_then_resync() {
        let frames = decode_all(b"BOGUS\n\n\0SEND\ndestination:/topic/a\n\nok\0");
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            Err(FrameError::UnknownCommand("BOGUS".to_string()))
        );
        assert_eq!(frames[1].as_ref().unwrap().body_str(), Some("ok"));
    }

    #[test]
    fn test_invalid_escape_and_header() {
        let frames = decode_all(b"SEND\nbad:\\x\n\n\0SEND\nnocolon\n\n\0");
        assert!(matches!(frames[0], Err(FrameError::InvalidEscape(_))));
        assert!(matches!(frames[1], Err(FrameError::InvalidHeader(_))));
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut decoder = FrameDecoder::new(64);
        let big = vec![b'x'; 100];
        let mut input = b"SEND\ndestination:/topic/a\n\n".to_vec();
        input.extend_from_slice(&big);
        let frames = decoder.decode(&input);
        assert_eq!(frames, vec![Err(FrameError::TooLarge { limit: 64 })]);

        // the tail of the rejected frame is skipped, the next one decodes
        let frames = decoder.decode(b"xxxx\0SEND\n\nsmall\0");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().body_str(), Some("small"));
    }

    #[test]
    fn test_bad_content_length() {
        let frames = decode_all(b"SEND\ncontent-length:abc\n\nx\0");
        assert!(matches!(frames[0], Err(FrameError::InvalidContentLength(_))));

        let frames = decode_all(b"SEND\ncontent-length:1\n\nxy\0");
        assert_eq!(frames[0], Err(FrameError::MissingTerminator));
    }

    #[test]
    fn test_huge_content_length_is_rejected() {
        let mut decoder = FrameDecoder::new(1024);
        let frames = decoder
            .decode(b"SEND\ndestination:/topic/a\ncontent-length:18446744073709551615\n\nx\0");
        assert_eq!(frames, vec![Err(FrameError::TooLarge { limit: 1024 })]);

        let frames = decoder.decode(b"SEND\ndestination:/topic/a\n\nnext\0");
        assert_eq!(frames[0].as_ref().unwrap().body_str(), Some("next"));
    }

    #[test]
    fn test_wrapping_content_length_is_rejected() {
        // body_start + len would wrap around to a NUL inside the headers
        let prefix = b"SEND\nx:\0\ncontent-length:";
        let digits = usize::MAX.to_string().len();
        let body_start = prefix.len() + digits + 2;
        let len = usize::MAX - (body_start - 7) + 1;

        let mut input = prefix.to_vec();
        input.extend_from_slice(format!("{:0width$}", len, width = digits).as_bytes());
        input.extend_from_slice(b"\n\n\0");

        let mut decoder = FrameDecoder::new(1024);
        let frames = decoder.decode(&input);
        assert!(!frames.is_empty());
        assert!(frames[0].is_err());

        let frames = decoder.decode(b"SEND\ndestination:/topic/a\n\nok\0");
        assert_eq!(frames.last().unwrap().as_ref().unwrap().body_str(), Some("ok"));
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = Frame::error("Unroutable destination", "/queue/x");
        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.get("message"), Some("Unroutable destination"));
        assert_eq!(frame.get("content-length"), Some("8"));
        assert!(frame.encode().ends_with(b"/queue/x\0"));
    }
}
