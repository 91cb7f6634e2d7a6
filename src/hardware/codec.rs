//! Wire framings for the two hardware generations.
//!
//! Both codecs are symmetric: the host side encodes requests and decodes
//! replies, the device side (used by the simulated bus) does the reverse.
//!
//! Legacy (daisy-chained syringe pumps and selector valves):
//! - Request: `/{addr}{cmd}R\r`
//! - Reply: `/0{status}{data}\x03\r\n`
//! - Status byte: `` ` `` ready, `@` busy. Lower nibble is the error code,
//!   bit 5 clear means busy.
//!
//! Current (checksummed line protocol):
//! - Request: `{addr}:{VERB}[ {arg}]*{xor:02X}\n`
//! - Reply: `{addr}:{OK|BUSY|ERR code}[ {data}]*{xor:02X}\n`

use std::fmt;

/// A command addressed to one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Directive {
    /// Device initialisation / homing
    Initialize,
    /// Continuous flow at the given commanded rate (µl/s)
    SetRate(f64),
    /// Select a valve position
    MoveValve(u8),
    /// Report status and current rate or position
    Query,
    /// Halt immediately
    Stop,
}

/// Device status carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    /// Command accepted
    Ok { busy: bool },
    /// Device refused the command (bad syntax or operand)
    Rejected(String),
    /// Device reports a fault (overload, not initialised, ...)
    Fault(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub data: String,
}

impl Reply {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ok { busy: false },
            data: data.into(),
        }
    }
}

/// Framing errors while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError(pub String);

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire framing used by a hardware family.
pub trait WireCodec: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encode_request(&self, address: &str, directive: Directive) -> Vec<u8>;

    /// Length of the first complete reply frame in `buf`, if any.
    fn reply_end(&self, buf: &[u8]) -> Option<usize>;

    fn decode_reply(&self, frame: &[u8]) -> Result<Reply, FrameError>;

    /// Length of the first complete request frame in `buf`, if any.
    fn request_end(&self, buf: &[u8]) -> Option<usize>;

    fn decode_request(&self, frame: &[u8]) -> Result<(String, Directive), FrameError>;

    fn encode_reply(&self, address: &str, reply: &Reply) -> Vec<u8>;
}

fn as_text(frame: &[u8]) -> Result<&str, FrameError> {
    std::str::from_utf8(frame).map_err(|_| FrameError("reply is not valid ASCII".into()))
}

fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, FrameError> {
    text.trim()
        .parse()
        .map_err(|_| FrameError(format!("invalid {what} '{text}'")))
}

// =============================================================================
// Legacy ASCII framing
// =============================================================================

const ETX: u8 = 0x03;

#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyCodec;

impl LegacyCodec {
    fn status_byte(status: &ReplyStatus) -> u8 {
        match status {
            ReplyStatus::Ok { busy: false } => b'`',
            ReplyStatus::Ok { busy: true } => b'@',
            // 'b': invalid command
            ReplyStatus::Rejected(_) => b'b',
            // 'i': overload
            ReplyStatus::Fault(_) => b'i',
        }
    }

    fn decode_status(byte: u8) -> ReplyStatus {
        let busy = byte & 0x20 == 0;
        match byte & 0x0F {
            0 => ReplyStatus::Ok { busy },
            2 => ReplyStatus::Rejected("invalid command".into()),
            3 => ReplyStatus::Rejected("invalid operand".into()),
            1 => ReplyStatus::Fault("initialization error".into()),
            7 => ReplyStatus::Fault("device not initialized".into()),
            9 => ReplyStatus::Fault("plunger overload".into()),
            10 => ReplyStatus::Fault("valve overload".into()),
            11 => ReplyStatus::Fault("move not allowed".into()),
            code => ReplyStatus::Fault(format!("error code {code}")),
        }
    }
}

impl WireCodec for LegacyCodec {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn encode_request(&self, address: &str, directive: Directive) -> Vec<u8> {
        let body = match directive {
            Directive::Initialize => "ZR".to_string(),
            Directive::SetRate(rate) => format!("V{rate:.3}R"),
            Directive::MoveValve(pos) => format!("B{pos}R"),
            Directive::Query => "Q".to_string(),
            Directive::Stop => "T".to_string(),
        };
        format!("/{address}{body}\r").into_bytes()
    }

    fn reply_end(&self, buf: &[u8]) -> Option<usize> {
        let etx = buf.iter().position(|b| *b == ETX)?;
        // Trailing CR LF is optional; swallow it when present.
        let mut end = etx + 1;
        while end < buf.len() && (buf[end] == b'\r' || buf[end] == b'\n') {
            end += 1;
        }
        Some(end)
    }

    fn decode_reply(&self, frame: &[u8]) -> Result<Reply, FrameError> {
        let start = frame
            .iter()
            .position(|b| *b == b'/')
            .ok_or_else(|| FrameError("missing start byte".into()))?;
        let etx = frame
            .iter()
            .position(|b| *b == ETX)
            .ok_or_else(|| FrameError("message not complete".into()))?;
        if etx < start + 3 {
            return Err(FrameError("reply too short".into()));
        }
        let status = Self::decode_status(frame[start + 2]);
        let data = as_text(&frame[start + 3..etx])?.to_string();
        Ok(Reply { status, data })
    }

    fn request_end(&self, buf: &[u8]) -> Option<usize> {
        buf.iter().position(|b| *b == b'\r').map(|i| i + 1)
    }

    fn decode_request(&self, frame: &[u8]) -> Result<(String, Directive), FrameError> {
        let text = as_text(frame)?.trim_end_matches('\r');
        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| FrameError("missing start byte".into()))?;
        let mut chars = rest.chars();
        let address = chars
            .next()
            .ok_or_else(|| FrameError("missing address".into()))?
            .to_string();
        let body = chars.as_str();
        let directive = if body == "ZR" {
            Directive::Initialize
        } else if body == "Q" {
            Directive::Query
        } else if body == "T" {
            Directive::Stop
        } else if let Some(arg) = body.strip_prefix('V').and_then(|b| b.strip_suffix('R')) {
            Directive::SetRate(parse_number(arg, "rate")?)
        } else if let Some(arg) = body.strip_prefix('B').and_then(|b| b.strip_suffix('R')) {
            Directive::MoveValve(parse_number(arg, "position")?)
        } else {
            return Err(FrameError(format!("unknown command '{body}'")));
        };
        Ok((address, directive))
    }

    fn encode_reply(&self, _address: &str, reply: &Reply) -> Vec<u8> {
        let mut out = vec![b'/', b'0', Self::status_byte(&reply.status)];
        out.extend_from_slice(reply.data.as_bytes());
        out.extend_from_slice(&[ETX, b'\r', b'\n']);
        out
    }
}

// =============================================================================
// Current checksummed framing
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct FramedCodec;

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

fn seal(body: &str) -> Vec<u8> {
    format!("{body}*{:02X}\n", xor_checksum(body.as_bytes())).into_bytes()
}

/// Split `addr:payload*CS\n`, verifying the checksum.
fn unseal(frame: &[u8]) -> Result<(&str, &str), FrameError> {
    let text = as_text(frame)?.trim_end_matches(['\r', '\n']);
    let (body, checksum) = text
        .rsplit_once('*')
        .ok_or_else(|| FrameError("missing checksum".into()))?;
    let expected = u8::from_str_radix(checksum, 16)
        .map_err(|_| FrameError(format!("invalid checksum '{checksum}'")))?;
    let actual = xor_checksum(body.as_bytes());
    if expected != actual {
        return Err(FrameError(format!(
            "checksum mismatch: expected {expected:02X}, computed {actual:02X}"
        )));
    }
    body.split_once(':')
        .ok_or_else(|| FrameError("missing address separator".into()))
}

impl WireCodec for FramedCodec {
    fn name(&self) -> &'static str {
        "current"
    }

    fn encode_request(&self, address: &str, directive: Directive) -> Vec<u8> {
        let payload = match directive {
            Directive::Initialize => "INIT".to_string(),
            Directive::SetRate(rate) => format!("RATE {rate:.4}"),
            Directive::MoveValve(pos) => format!("POS {pos}"),
            Directive::Query => "STAT?".to_string(),
            Directive::Stop => "STOP".to_string(),
        };
        seal(&format!("{address}:{payload}"))
    }

    fn reply_end(&self, buf: &[u8]) -> Option<usize> {
        buf.iter().position(|b| *b == b'\n').map(|i| i + 1)
    }

    fn decode_reply(&self, frame: &[u8]) -> Result<Reply, FrameError> {
        let (_, payload) = unseal(frame)?;
        let (head, data) = payload.split_once(' ').unwrap_or((payload, ""));
        let status = match head {
            "OK" => ReplyStatus::Ok { busy: false },
            "BUSY" => ReplyStatus::Ok { busy: true },
            "ERR" => {
                let (code, message) = data.split_once(' ').unwrap_or((data, ""));
                let code: u16 = parse_number(code, "error code")?;
                let reply = if (100..200).contains(&code) {
                    ReplyStatus::Rejected(format!("E{code} {message}").trim().to_string())
                } else {
                    ReplyStatus::Fault(format!("E{code} {message}").trim().to_string())
                };
                return Ok(Reply {
                    status: reply,
                    data: String::new(),
                });
            }
            other => return Err(FrameError(format!("unknown reply '{other}'"))),
        };
        Ok(Reply {
            status,
            data: data.to_string(),
        })
    }

    fn request_end(&self, buf: &[u8]) -> Option<usize> {
        self.reply_end(buf)
    }

    fn decode_request(&self, frame: &[u8]) -> Result<(String, Directive), FrameError> {
        let (address, payload) = unseal(frame)?;
        let (verb, arg) = payload.split_once(' ').unwrap_or((payload, ""));
        let directive = match verb {
            "INIT" => Directive::Initialize,
            "STAT?" => Directive::Query,
            "STOP" => Directive::Stop,
            "RATE" => Directive::SetRate(parse_number(arg, "rate")?),
            "POS" => Directive::MoveValve(parse_number(arg, "position")?),
            other => return Err(FrameError(format!("unknown verb '{other}'"))),
        };
        Ok((address.to_string(), directive))
    }

    fn encode_reply(&self, address: &str, reply: &Reply) -> Vec<u8> {
        let head = match &reply.status {
            ReplyStatus::Ok { busy: false } => "OK".to_string(),
            ReplyStatus::Ok { busy: true } => "BUSY".to_string(),
            ReplyStatus::Rejected(msg) => format!("ERR 101 {msg}"),
            ReplyStatus::Fault(msg) => format!("ERR 201 {msg}"),
        };
        let body = if reply.data.is_empty() {
            format!("{address}:{head}")
        } else {
            format!("{address}:{head} {}", reply.data)
        };
        seal(&body)
    }
}
