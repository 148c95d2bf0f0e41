use std::fmt;

use crate::sip::message::{SipHeader, SipMethod, SipRequest, SipResponse};

/// リクエスト組み立て用の Builder。ヘッダは与えた順のまま保持する。
/// Content-Length はここでは積まず、直列化の段で不足していれば補う。
pub struct SipRequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<SipHeader>,
    body: Vec<u8>,
}

/// レスポンス側も同じ流儀。
pub struct SipResponseBuilder {
    status_code: u16,
    reason_phrase: String,
    headers: Vec<SipHeader>,
    body: Vec<u8>,
}

impl SipRequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(SipHeader::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        self.body = body.into();
        if let Some(ct) = content_type {
            push_if_absent(&mut self.headers, "Content-Type", ct);
        }
        self
    }

    pub fn build(self) -> SipRequest {
        SipRequest {
            method: self.method,
            uri: self.uri,
            version: "SIP/2.0".to_string(),
            headers: self.headers,
            body: self.body,
        }
    }
}

impl SipResponseBuilder {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code: code,
            reason_phrase: reason.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(SipHeader::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        self.body = body.into();
        if let Some(ct) = content_type {
            push_if_absent(&mut self.headers, "Content-Type", ct);
        }
        self
    }

    pub fn build(self) -> SipResponse {
        SipResponse {
            version: "SIP/2.0".to_string(),
            status_code: self.status_code,
            reason_phrase: self.reason_phrase,
            headers: self.headers,
            body: self.body,
        }
    }
}

fn push_if_absent(headers: &mut Vec<SipHeader>, name: &str, value: &str) {
    let exists = headers.iter().any(|h| h.name.eq_ignore_ascii_case(name));
    if !exists {
        headers.push(SipHeader::new(name, value));
    }
}

/// ヘッダ部を書き出す。各行 CRLF 終端、Content-Length が無ければ
/// ボディ長から起こして最後に足し、空行で締める。
fn write_header_block(
    out: &mut fmt::Formatter<'_>,
    headers: &[SipHeader],
    body_len: usize,
) -> fmt::Result {
    let mut has_length = false;
    for h in headers {
        has_length = has_length || h.name.eq_ignore_ascii_case("Content-Length");
        writeln!(out, "{}: {}\r", h.name, h.value)?;
    }
    if !has_length {
        writeln!(out, "Content-Length: {}\r", body_len)?;
    }
    out.write_str("\r\n")
}

/// リクエストの基本ヘッダをそのまま写した応答を組み立てる。
/// Via/From/To/Call-ID/CSeq のどれかが欠けていたら None。
pub fn response_simple_from_request(
    req: &SipRequest,
    code: u16,
    reason: &str,
) -> Option<SipResponse> {
    let mut builder = SipResponseBuilder::new(code, reason);
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        builder = builder.header(name, req.header_value(name)?);
    }
    Some(builder.build())
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}\r", self.method.as_str(), self.uri, self.version)?;
        write_header_block(f, &self.headers, self.body.len())
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} {}\r",
            self.version, self.status_code, self.reason_phrase
        )?;
        write_header_block(f, &self.headers, self.body.len())
    }
}

impl SipRequest {
    /// ワイヤ形式。ヘッダ部を文字列化してからボディを連結する。
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut wire = self.to_string().into_bytes();
        wire.extend_from_slice(&self.body);
        wire
    }
}

impl SipResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut wire = self.to_string().into_bytes();
        wire.extend_from_slice(&self.body);
        wire
    }
}
