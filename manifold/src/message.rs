//! The typed message value object and its wire codec.
//!
//! A message travels as one length-prefixed frame:
//!
//! ```text
//! frame  := len:u32 body              (len = byte length of body)
//! body   := kind:u8 flags:u8 serial:u32 reply_serial:u32
//!           nfields:u8 { field_code:u8 str }*
//!           nargs:u8 { tag:u8 payload }*
//! str    := len:u16 bytes             (UTF-8, no NUL)
//! ```
//!
//! All integers are big-endian. The framing itself (reading `len`, waiting
//! for a complete body) is the channel's job; this module encodes and
//! decodes bodies.

use crate::support::{BusError, BusResult, ErrorKind, ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Byte length of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on the body of a single frame. Oversized frames are a
/// protocol error and kill the connection.
pub const MAX_FRAME_SIZE: usize = 1 << 17;

/// Header flag: the sender does not want a method return.
pub const NO_REPLY_EXPECTED: u8 = 0x1;

const FIELD_SENDER: u8 = 1;
const FIELD_DESTINATION: u8 = 2;
const FIELD_INTERFACE: u8 = 3;
const FIELD_MEMBER: u8 = 4;
const FIELD_PATH: u8 = 5;
const FIELD_ERROR_NAME: u8 = 6;

const ARG_STR: u8 = 1;
const ARG_U32: u8 = 2;
const ARG_BOOL: u8 = 3;
const ARG_STR_ARRAY: u8 = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageKind {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageKind {
    #[inline]
    pub fn from_wire(raw: u8) -> Option<MessageKind> {
        match raw {
            1 => Some(MessageKind::MethodCall),
            2 => Some(MessageKind::MethodReturn),
            3 => Some(MessageKind::Error),
            4 => Some(MessageKind::Signal),
            _ => None,
        }
    }

    /// Spelling used by the match-rule grammar (`type='signal'`).
    pub fn rule_name(self) -> &'static str {
        match self {
            MessageKind::MethodCall => "method_call",
            MessageKind::MethodReturn => "method_return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        }
    }

    pub fn from_rule_name(name: &str) -> Option<MessageKind> {
        match name {
            "method_call" => Some(MessageKind::MethodCall),
            "method_return" => Some(MessageKind::MethodReturn),
            "error" => Some(MessageKind::Error),
            "signal" => Some(MessageKind::Signal),
            _ => None,
        }
    }
}

impl From<MessageKind> for u8 {
    #[inline]
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

/// One typed argument in a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Str(String),
    U32(u32),
    Bool(bool),
    StrArray(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub flags: u8,
    pub serial: u32,
    pub reply_serial: u32,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub error_name: Option<String>,
    pub args: Vec<Arg>,
}

impl Message {
    fn empty(kind: MessageKind) -> Message {
        Message {
            kind,
            flags: 0,
            serial: 0,
            reply_serial: 0,
            sender: None,
            destination: None,
            interface: None,
            member: None,
            path: None,
            error_name: None,
            args: Vec::new(),
        }
    }

    /// New method call addressed to `destination`.
    pub fn method_call(destination: &str, interface: &str, member: &str) -> Message {
        let mut msg = Message::empty(MessageKind::MethodCall);
        msg.destination = Some(destination.to_string());
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        msg
    }

    /// New signal. The caller decides the destination (a concrete name, the
    /// broadcast sentinel, or none for daemon-local signals).
    pub fn signal(interface: &str, member: &str) -> Message {
        let mut msg = Message::empty(MessageKind::Signal);
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        msg
    }

    /// Free-standing error message not tied to a request; the sender
    /// patches destination and reply serial before it goes out. This is
    /// what the per-connection OOM reserve holds.
    pub fn error(kind: ErrorKind, detail: &str) -> Message {
        let mut msg = Message::empty(MessageKind::Error);
        msg.error_name = Some(kind.wire_name().to_string());
        msg.args.push(Arg::Str(detail.to_string()));
        msg
    }

    /// New method return answering `request`. Copies the request serial and
    /// addresses the requester.
    pub fn method_return_to(request: &Message) -> Message {
        let mut msg = Message::empty(MessageKind::MethodReturn);
        msg.reply_serial = request.serial;
        msg.destination = request.sender.clone();
        msg
    }

    /// New error reply answering `request`, carrying the wire name of
    /// `kind` and a human-readable detail string as the sole argument.
    pub fn error_reply_to(request: &Message, kind: ErrorKind, detail: &str) -> Message {
        let mut msg = Message::empty(MessageKind::Error);
        msg.reply_serial = request.serial;
        msg.destination = request.sender.clone();
        msg.error_name = Some(kind.wire_name().to_string());
        msg.args.push(Arg::Str(detail.to_string()));
        msg
    }

    /// Builder-style argument append.
    #[inline]
    pub fn with_arg(mut self, arg: Arg) -> Message {
        self.args.push(arg);
        self
    }

    #[inline]
    pub fn wants_reply(&self) -> bool {
        self.kind == MessageKind::MethodCall && self.flags & NO_REPLY_EXPECTED == 0
    }

    /// Error kind reflected from the wire error name, for error messages.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_name.as_ref().and_then(|name| ErrorKind::from_wire_name(name))
    }

    /// Typed accessor: argument `index` as a string.
    pub fn arg_str(&self, index: usize) -> BusResult<&str> {
        match self.args.get(index) {
            Some(Arg::Str(value)) => Ok(value),
            _ => Err(self.arg_error(index, "string")),
        }
    }

    /// Typed accessor: argument `index` as a u32.
    pub fn arg_u32(&self, index: usize) -> BusResult<u32> {
        match self.args.get(index) {
            Some(Arg::U32(value)) => Ok(*value),
            _ => Err(self.arg_error(index, "u32")),
        }
    }

    /// Typed accessor: argument `index` as a bool.
    pub fn arg_bool(&self, index: usize) -> BusResult<bool> {
        match self.args.get(index) {
            Some(Arg::Bool(value)) => Ok(*value),
            _ => Err(self.arg_error(index, "bool")),
        }
    }

    fn arg_error(&self, index: usize, expected: &str) -> BusError {
        BusError::new(
            ErrorKind::InvalidArgs,
            format!(
                "argument {} of {:?} is not a {}",
                index,
                self.member.as_deref().unwrap_or("<no member>"),
                expected
            ),
        )
    }

    /// Exact byte size of the encoded frame, length prefix included. Used
    /// to reserve outbound capacity at transaction stage time.
    pub fn wire_size(&self) -> usize {
        let mut size = FRAME_HEADER_SIZE + 1 + 1 + 4 + 4 + 1 + 1;

        for field in self.fields() {
            if let Some(value) = field.1 {
                size += 1 + 2 + value.len();
            }
        }

        for arg in &self.args {
            size += 1;
            size += match arg {
                Arg::Str(value) => 2 + value.len(),
                Arg::U32(_) => 4,
                Arg::Bool(_) => 1,
                Arg::StrArray(values) => {
                    2 + values.iter().map(|value| 2 + value.len()).sum::<usize>()
                }
            };
        }

        size
    }

    fn fields(&self) -> [(u8, Option<&String>); 6] {
        [
            (FIELD_SENDER, self.sender.as_ref()),
            (FIELD_DESTINATION, self.destination.as_ref()),
            (FIELD_INTERFACE, self.interface.as_ref()),
            (FIELD_MEMBER, self.member.as_ref()),
            (FIELD_PATH, self.path.as_ref()),
            (FIELD_ERROR_NAME, self.error_name.as_ref()),
        ]
    }

    /// Encode into a complete frame (length prefix + body).
    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        let body_size = self.wire_size() - FRAME_HEADER_SIZE;

        if body_size > MAX_FRAME_SIZE {
            return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body_size);
        frame.write_u32::<BigEndian>(body_size as u32)?;

        frame.write_u8(self.kind.into())?;
        frame.write_u8(self.flags)?;
        frame.write_u32::<BigEndian>(self.serial)?;
        frame.write_u32::<BigEndian>(self.reply_serial)?;

        let nfields = self.fields().iter().filter(|field| field.1.is_some()).count();
        frame.write_u8(nfields as u8)?;
        for (code, value) in self.fields().iter() {
            if let Some(value) = value {
                frame.write_u8(*code)?;
                write_str(&mut frame, value)?;
            }
        }

        if self.args.len() > u8::max_value() as usize {
            return Err(NetworkError::Fatal(ErrorType::BadFrame));
        }
        frame.write_u8(self.args.len() as u8)?;
        for arg in &self.args {
            match arg {
                Arg::Str(value) => {
                    frame.write_u8(ARG_STR)?;
                    write_str(&mut frame, value)?;
                }
                Arg::U32(value) => {
                    frame.write_u8(ARG_U32)?;
                    frame.write_u32::<BigEndian>(*value)?;
                }
                Arg::Bool(value) => {
                    frame.write_u8(ARG_BOOL)?;
                    frame.write_u8(*value as u8)?;
                }
                Arg::StrArray(values) => {
                    frame.write_u8(ARG_STR_ARRAY)?;
                    if values.len() > u16::max_value() as usize {
                        return Err(NetworkError::Fatal(ErrorType::BadFrame));
                    }
                    frame.write_u16::<BigEndian>(values.len() as u16)?;
                    for value in values {
                        write_str(&mut frame, value)?;
                    }
                }
            }
        }

        debug_assert_eq!(frame.len(), self.wire_size());

        Ok(frame)
    }

    /// Decode one frame body. The caller has already consumed the length
    /// prefix and supplies exactly `len` bytes.
    pub fn decode(body: &[u8]) -> NetworkResult<Message> {
        let mut stream = Cursor::new(body);

        let kind = MessageKind::from_wire(stream.read_u8()?)
            .ok_or(NetworkError::Fatal(ErrorType::BadFrame))?;

        let mut msg = Message::empty(kind);
        msg.flags = stream.read_u8()?;
        msg.serial = stream.read_u32::<BigEndian>()?;
        msg.reply_serial = stream.read_u32::<BigEndian>()?;

        let nfields = stream.read_u8()?;
        for _ in 0..nfields {
            let code = stream.read_u8()?;
            let value = read_str(&mut stream)?;
            let slot = match code {
                FIELD_SENDER => &mut msg.sender,
                FIELD_DESTINATION => &mut msg.destination,
                FIELD_INTERFACE => &mut msg.interface,
                FIELD_MEMBER => &mut msg.member,
                FIELD_PATH => &mut msg.path,
                FIELD_ERROR_NAME => &mut msg.error_name,
                _ => return Err(NetworkError::Fatal(ErrorType::BadFrame)),
            };
            if slot.is_some() {
                // Duplicate field codes are a protocol error.
                return Err(NetworkError::Fatal(ErrorType::BadFrame));
            }
            *slot = Some(value);
        }

        let nargs = stream.read_u8()?;
        for _ in 0..nargs {
            let arg = match stream.read_u8()? {
                ARG_STR => Arg::Str(read_str(&mut stream)?),
                ARG_U32 => Arg::U32(stream.read_u32::<BigEndian>()?),
                ARG_BOOL => Arg::Bool(stream.read_u8()? != 0),
                ARG_STR_ARRAY => {
                    let count = stream.read_u16::<BigEndian>()?;
                    let mut values = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        values.push(read_str(&mut stream)?);
                    }
                    Arg::StrArray(values)
                }
                _ => return Err(NetworkError::Fatal(ErrorType::BadFrame)),
            };
            msg.args.push(arg);
        }

        if stream.position() as usize != body.len() {
            // Trailing garbage after the declared payload.
            return Err(NetworkError::Fatal(ErrorType::BadFrame));
        }

        Ok(msg)
    }
}

fn write_str(frame: &mut Vec<u8>, value: &str) -> NetworkResult<()> {
    if value.len() > u16::max_value() as usize {
        return Err(NetworkError::Fatal(ErrorType::BadFrame));
    }
    if value.as_bytes().contains(&0) {
        return Err(NetworkError::Fatal(ErrorType::BadFrame));
    }
    frame.write_u16::<BigEndian>(value.len() as u16)?;
    frame.write_all(value.as_bytes())?;
    Ok(())
}

fn read_str(stream: &mut Cursor<&[u8]>) -> NetworkResult<String> {
    let len = stream.read_u16::<BigEndian>()? as usize;
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw)?;

    if raw.contains(&0) {
        return Err(NetworkError::Fatal(ErrorType::BadFrame));
    }

    String::from_utf8(raw).map_err(|_| NetworkError::Fatal(ErrorType::BadFrame))
}
