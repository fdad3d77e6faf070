//! AMF0 value decoding/encoding, and the command rewrite table that edits a
//! decoded invocation before it is re-encoded and forwarded upstream.

use thiserror::Error;

use crate::config::RewriteConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmfError {
    #[error("truncated amf0 value stream")]
    Truncated,
    #[error("unknown amf0 type marker: {0:#04x}")]
    UnknownMarker(u8),
    #[error("{0} expected args[{1}] to be {2}")]
    WrongArgShape(&'static str, usize, &'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
}

impl Amf0Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn as_object_pairs(&self) -> &[(String, Amf0Value)] {
        match self {
            Amf0Value::Object(pairs) | Amf0Value::EcmaArray(pairs) => pairs,
            _ => panic!("not an object/ecma array"),
        }
    }

    /// Overwrite (or insert) a key in an `Object`/`EcmaArray` in place.
    fn set_property(&mut self, key: &str, value: Amf0Value) {
        if let Amf0Value::Object(pairs) | Amf0Value::EcmaArray(pairs) = self {
            if let Some(entry) = pairs.iter_mut().find(|(k, _)| k == key) {
                entry.1 = value;
            } else {
                pairs.push((key.to_string(), value));
            }
        }
    }
}

// ── Decoder ──

pub struct Amf0Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Amf0Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn decode(&mut self) -> Result<Amf0Value, AmfError> {
        if self.pos >= self.data.len() {
            return Err(AmfError::Truncated);
        }
        let marker = self.data[self.pos];
        self.pos += 1;

        match marker {
            0x00 => self.read_number(),
            0x01 => self.read_boolean(),
            0x02 => self.read_string(),
            0x03 => self.read_object(),
            0x05 => Ok(Amf0Value::Null),
            0x06 => Ok(Amf0Value::Undefined),
            0x08 => self.read_ecma_array(),
            0x0A => self.read_strict_array(),
            0x0C => self.read_long_string(),
            other => Err(AmfError::UnknownMarker(other)),
        }
    }

    /// Decode values until the slice is exhausted.
    pub fn decode_all(&mut self) -> Result<Vec<Amf0Value>, AmfError> {
        let mut values = Vec::new();
        while self.remaining() > 0 {
            values.push(self.decode()?);
        }
        Ok(values)
    }

    fn read_number(&mut self) -> Result<Amf0Value, AmfError> {
        if self.pos + 8 > self.data.len() {
            return Err(AmfError::Truncated);
        }
        let bytes: [u8; 8] = self.data[self.pos..self.pos + 8].try_into().unwrap();
        self.pos += 8;
        Ok(Amf0Value::Number(f64::from_be_bytes(bytes)))
    }

    fn read_boolean(&mut self) -> Result<Amf0Value, AmfError> {
        if self.pos >= self.data.len() {
            return Err(AmfError::Truncated);
        }
        let val = self.data[self.pos] != 0;
        self.pos += 1;
        Ok(Amf0Value::Boolean(val))
    }

    fn read_utf8(&mut self) -> Result<String, AmfError> {
        if self.pos + 2 > self.data.len() {
            return Err(AmfError::Truncated);
        }
        let len = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]) as usize;
        self.pos += 2;
        if self.pos + len > self.data.len() {
            return Err(AmfError::Truncated);
        }
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).into_owned();
        self.pos += len;
        Ok(s)
    }

    fn read_string(&mut self) -> Result<Amf0Value, AmfError> {
        self.read_utf8().map(Amf0Value::String)
    }

    fn read_long_string(&mut self) -> Result<Amf0Value, AmfError> {
        if self.pos + 4 > self.data.len() {
            return Err(AmfError::Truncated);
        }
        let len = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        if self.pos + len > self.data.len() {
            return Err(AmfError::Truncated);
        }
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).into_owned();
        self.pos += len;
        Ok(Amf0Value::String(s))
    }

    fn read_object_properties(&mut self) -> Result<Vec<(String, Amf0Value)>, AmfError> {
        let mut pairs = Vec::new();
        loop {
            if self.pos + 3 <= self.data.len()
                && self.data[self.pos] == 0x00
                && self.data[self.pos + 1] == 0x00
                && self.data[self.pos + 2] == 0x09
            {
                self.pos += 3;
                break;
            }
            let key = self.read_utf8()?;
            let value = self.decode()?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    fn read_object(&mut self) -> Result<Amf0Value, AmfError> {
        self.read_object_properties().map(Amf0Value::Object)
    }

    fn read_ecma_array(&mut self) -> Result<Amf0Value, AmfError> {
        if self.pos + 4 > self.data.len() {
            return Err(AmfError::Truncated);
        }
        self.pos += 4; // approximate element count, unreliable in the wild
        self.read_object_properties().map(Amf0Value::EcmaArray)
    }

    fn read_strict_array(&mut self) -> Result<Amf0Value, AmfError> {
        if self.pos + 4 > self.data.len() {
            return Err(AmfError::Truncated);
        }
        let count = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(self.decode()?);
        }
        Ok(Amf0Value::StrictArray(items))
    }
}

// ── Encoder ──

pub struct Amf0Encoder {
    buf: Vec<u8>,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_number(&mut self, val: f64) -> &mut Self {
        self.buf.push(0x00);
        self.buf.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_string(&mut self, val: &str) -> &mut Self {
        self.buf.push(0x02);
        self.write_utf8(val);
        self
    }

    fn write_utf8(&mut self, val: &str) {
        let len = val.len().min(u16::MAX as usize) as u16;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(&val.as_bytes()[..len as usize]);
    }

    pub fn write_value(&mut self, val: &Amf0Value) -> &mut Self {
        match val {
            Amf0Value::Number(n) => {
                self.buf.push(0x00);
                self.buf.extend_from_slice(&n.to_be_bytes());
            }
            Amf0Value::Boolean(b) => {
                self.buf.push(0x01);
                self.buf.push(if *b { 1 } else { 0 });
            }
            Amf0Value::String(s) => {
                self.buf.push(0x02);
                self.write_utf8(s);
            }
            Amf0Value::Null => self.buf.push(0x05),
            Amf0Value::Undefined => self.buf.push(0x06),
            Amf0Value::Object(pairs) => {
                self.buf.push(0x03);
                for (k, v) in pairs {
                    self.write_utf8(k);
                    self.write_value(v);
                }
                self.buf.extend_from_slice(&[0x00, 0x00, 0x09]);
            }
            Amf0Value::EcmaArray(pairs) => {
                self.buf.push(0x08);
                self.buf.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
                for (k, v) in pairs {
                    self.write_utf8(k);
                    self.write_value(v);
                }
                self.buf.extend_from_slice(&[0x00, 0x00, 0x09]);
            }
            Amf0Value::StrictArray(items) => {
                self.buf.push(0x0A);
                self.buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    self.write_value(item);
                }
            }
        }
        self
    }
}

/// The decoded shape of one AMF0 command invocation: `command`, `transid`,
/// then zero or more argument values.
pub struct Command {
    pub name: String,
    pub transid: f64,
    pub args: Vec<Amf0Value>,
}

pub fn decode_command(payload: &[u8]) -> Result<Command, AmfError> {
    let mut dec = Amf0Decoder::new(payload);
    let name = dec
        .decode()?
        .as_str()
        .ok_or(AmfError::WrongArgShape("command", 0, "a String"))?
        .to_string();
    let transid = dec
        .decode()?
        .as_f64()
        .ok_or(AmfError::WrongArgShape("command", 1, "a Number"))?;
    let args = dec.decode_all()?;
    Ok(Command { name, transid, args })
}

fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut enc = Amf0Encoder::new();
    enc.write_string(&cmd.name);
    enc.write_number(cmd.transid);
    for arg in &cmd.args {
        enc.write_value(arg);
    }
    enc.into_bytes()
}

/// Apply the operator's rewrite table to a decoded command, per the rewrite
/// table: `connect` overwrites `app`/`swfUrl`/`tcUrl` on its object argument;
/// `releaseStream`/`FCPublish`/`publish` overwrite `args[1]` with the
/// configured stream name; `publish` additionally signals that the session
/// should drop to blind copying once this message is forwarded.
///
/// Returns the re-encoded payload and whether the caller should switch to
/// copy mode.
pub fn rewrite_command(payload: &[u8], cfg: &RewriteConfig) -> Result<(Vec<u8>, bool), AmfError> {
    let mut cmd = decode_command(payload)?;
    let mut use_copy = false;

    tracing::debug!(command = %cmd.name, transid = cmd.transid, "rewriting command");

    match cmd.name.as_str() {
        "connect" => {
            let obj = cmd
                .args
                .get_mut(0)
                .filter(|v| matches!(v, Amf0Value::Object(_)))
                .ok_or(AmfError::WrongArgShape("connect", 0, "an Object"))?;
            obj.set_property("app", Amf0Value::String(cfg.app_name.clone()));
            obj.set_property("swfUrl", Amf0Value::String(cfg.play_url.clone()));
            obj.set_property("tcUrl", Amf0Value::String(cfg.play_url.clone()));
        }
        "releaseStream" | "FCPublish" | "publish" => {
            if cmd.args.len() < 2 {
                return Err(AmfError::WrongArgShape(
                    "releaseStream/FCPublish/publish",
                    1,
                    "present",
                ));
            }
            cmd.args[1] = Amf0Value::String(cfg.stream_name.clone());
            if cmd.name == "publish" {
                use_copy = true;
            }
        }
        _ => {}
    }

    Ok((encode_command(&cmd), use_copy))
}
