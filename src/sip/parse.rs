use anyhow::{anyhow, bail, Result};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{map_res, rest},
    sequence::{pair, preceded, separated_pair},
    IResult,
};

use crate::sip::message::{SipHeader, SipMessage, SipMethod, SipRequest, SipResponse};

/// UDP データグラム 1 個を SIP メッセージとして読む。
/// 先頭行でリクエスト/レスポンスを見分け、最初の空行までをヘッダ、
/// 残りをボディそのままとして保持する。
pub fn parse_sip_message(input: &str) -> Result<SipMessage> {
    let (head, body) = cut_at_blank_line(input);

    let mut lines = head.lines().map(|raw| raw.strip_suffix('\r').unwrap_or(raw));
    let start = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("datagram has no start line"))?;
    let headers = read_headers(lines)?;
    let body = body.as_bytes().to_vec();

    // レスポンス行から先に試す。リクエスト行の読み方は緩いので、逆順だと
    // "SIP/2.0 200 OK" をメソッド扱いしてしまう。
    if let Ok((_, (status, reason))) = status_line(start) {
        return Ok(SipMessage::Response(SipResponse {
            version: "SIP/2.0".to_string(),
            status_code: status,
            reason_phrase: reason.trim().to_string(),
            headers,
            body,
        }));
    }

    let (method, uri, version) = request_line(start)?;
    Ok(SipMessage::Request(SipRequest {
        method,
        uri,
        version,
        headers,
        body,
    }))
}

/// 最初の空行でヘッダ部とボディを切り離す。空行が無ければ全体をヘッダ部扱い。
fn cut_at_blank_line(input: &str) -> (&str, &str) {
    for sep in ["\r\n\r\n", "\n\n"] {
        if let Some(pos) = input.find(sep) {
            return (&input[..pos], &input[pos + sep.len()..]);
        }
    }
    (input, "")
}

fn status_line(input: &str) -> IResult<&str, (u16, &str)> {
    preceded(
        pair(tag("SIP/2.0"), space1),
        separated_pair(map_res(digit1, str::parse::<u16>), space1, rest),
    )(input)
}

fn request_line(line: &str) -> Result<(SipMethod, String, String)> {
    let mut words = line.split_ascii_whitespace();
    let (Some(method), Some(uri), Some(version), None) =
        (words.next(), words.next(), words.next(), words.next())
    else {
        bail!("malformed start line: {:?}", line);
    };
    if !version.starts_with("SIP/") {
        bail!("unsupported protocol version in start line: {:?}", line);
    }
    Ok((
        method_from_token(method),
        uri.to_string(),
        version.to_string(),
    ))
}

fn read_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<SipHeader>> {
    let mut headers: Vec<SipHeader> = Vec::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // 折り返し行は直前のヘッダ値へ連結する
            if let Some(prev) = headers.last_mut() {
                prev.value.push(' ');
                prev.value.push_str(line.trim_start());
            }
            continue;
        }
        let (_, (name, value)) =
            header_line(line).map_err(|_| anyhow!("header line without colon: {:?}", line))?;
        headers.push(SipHeader::new(name.trim(), value.trim()));
    }

    Ok(headers)
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| c != ':'),
        pair(char(':'), space0),
        rest,
    )(input)
}

fn method_from_token(token: &str) -> SipMethod {
    match token.to_ascii_uppercase().as_str() {
        "REGISTER" => SipMethod::Register,
        "INVITE" => SipMethod::Invite,
        "ACK" => SipMethod::Ack,
        "BYE" => SipMethod::Bye,
        other => SipMethod::Unknown(other.to_string()),
    }
}
