//! RTSP 유사 텍스트 메시지
//!
//! ```text
//! <COMMAND> <target> <protocol>\r\n
//! Name: value\r\n
//! ...
//! \r\n
//! payload
//! ```

use std::fmt::Write as _;

use crate::{Error, Result, RTSP_PROTOCOL};

/// 헤더/본문 구분자를 찾아 (헤더 텍스트, payload) 분리
fn split_message(text: &str) -> (&str, &str) {
    if let Some(pos) = text.find("\r\n\r\n") {
        (&text[..pos], &text[pos + 4..])
    } else if let Some(pos) = text.find("\n\n") {
        (&text[..pos], &text[pos + 2..])
    } else {
        (text, "")
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// 클라이언트 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub target: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
    pub payload: String,
}

impl Request {
    pub fn new(command: &str, target: &str) -> Self {
        Self {
            command: command.to_string(),
            target: target.to_string(),
            protocol: RTSP_PROTOCOL.to_string(),
            headers: Vec::new(),
            payload: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// 수신 버퍼 파싱
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buf)
            .map_err(|e| Error::MalformedRequest(format!("UTF-8 아님: {}", e)))?;
        let (head, payload) = split_message(text);

        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));
        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| Error::MalformedRequest("빈 요청".into()))?;

        let mut parts = request_line.split_whitespace();
        let (command, target, protocol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(c), Some(t), Some(p)) => (c, t, p),
            _ => {
                return Err(Error::MalformedRequest(format!(
                    "요청 라인 형식 오류: {:?}",
                    request_line
                )))
            }
        };

        Ok(Self {
            command: command.to_string(),
            target: target.to_string(),
            protocol: protocol.to_string(),
            headers: parse_headers(lines),
            payload: payload.to_string(),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// CSeq 헤더, 없거나 숫자가 아니면 0
    pub fn sequence_number(&self) -> u32 {
        self.header("CSeq")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.command, self.target, self.protocol);
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        if !self.payload.is_empty() {
            let _ = write!(out, "Content-length: {}\r\n", self.payload.len());
        }
        out.push_str("\r\n");
        out.push_str(&self.payload);
        out.into_bytes()
    }
}

/// 서버 응답
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub protocol: String,
    pub code: u16,
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub payload: String,
}

impl Response {
    /// CSeq 헤더를 포함한 응답
    pub fn new(code: u16, status: &str, cseq: u32) -> Self {
        Self {
            protocol: RTSP_PROTOCOL.to_string(),
            code,
            status: status.to_string(),
            headers: vec![("CSeq".to_string(), cseq.to_string())],
            payload: String::new(),
        }
    }

    pub fn ok(cseq: u32) -> Self {
        Self::new(200, "OK", cseq)
    }

    pub fn bad_request(cseq: u32) -> Self {
        Self::new(400, "BAD REQUEST", cseq)
    }

    pub fn not_found(cseq: u32) -> Self {
        Self::new(404, "NOT FOUND", cseq)
    }

    pub fn service_unavailable(cseq: u32) -> Self {
        Self::new(503, "Service Unavailable", cseq)
    }

    pub fn with_header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.protocol, self.code, self.status);
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        if !self.payload.is_empty() {
            let _ = write!(out, "Content-length: {}\r\n", self.payload.len());
        }
        out.push_str("\r\n");
        out.push_str(&self.payload);
        out.into_bytes()
    }

    /// 응답 파싱 (클라이언트 측)
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buf)
            .map_err(|e| Error::MalformedRequest(format!("UTF-8 아님: {}", e)))?;
        let (head, payload) = split_message(text);

        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));
        let status_line = lines
            .next()
            .ok_or_else(|| Error::MalformedRequest("빈 응답".into()))?;

        let mut parts = status_line.splitn(3, ' ');
        let protocol = parts.next().unwrap_or_default();
        let code = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| Error::MalformedRequest(format!("상태 라인 형식 오류: {:?}", status_line)))?;
        let status = parts.next().unwrap_or_default();

        let headers: Vec<(String, String)> = parse_headers(lines)
            .into_iter()
            .filter(|(n, _)| !n.eq_ignore_ascii_case("Content-length"))
            .collect();

        Ok(Self {
            protocol: protocol.to_string(),
            code,
            status: status.to_string(),
            headers,
            payload: payload.to_string(),
        })
    }
}
