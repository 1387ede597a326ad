//! Resumable frame encoder and decoder for [`Command`]s.
//!
//! Both sides are sans-IO: the encoder fills a bounded [`WriteCursor`] and
//! suspends when it is full, the decoder consumes whatever a [`ReadCursor`]
//! holds and suspends when it runs dry. Payloads are streamed in chunks, so
//! a large ON_BLOCK never needs a buffer of its own size.

use bytes::Bytes;

use weft_core::codec::{
    StringDecoder, StringEncoder, TickDecoder, TickEncoder, TickSetDecoder, TickSetEncoder,
};
use weft_core::{need, ready};
use weft_core::{Block, CodecError, Progress, ReadCursor, Tick, TickSet, WriteCursor};
use weft_perms::Permission;

use crate::command::{Address, Command, Opcode};

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Part {
    U8(u8),
    U16(u16),
    U32(u32),
    Str(StringEncoder),
    Tick(TickEncoder),
    Ticks(TickSetEncoder),
    Payload {
        buffers: Vec<Bytes>,
        index: usize,
        offset: usize,
    },
}

impl Part {
    fn str(s: &str) -> Part {
        Part::Str(StringEncoder::new(Some(s)))
    }

    fn encode(&mut self, cur: &mut WriteCursor) -> Result<Progress<()>, CodecError> {
        match self {
            Part::U8(v) => {
                if !cur.can_write(1) {
                    return Ok(Progress::Suspended);
                }
                cur.put_u8(*v);
            }
            Part::U16(v) => {
                if !cur.can_write(2) {
                    return Ok(Progress::Suspended);
                }
                cur.put_u16(*v);
            }
            Part::U32(v) => {
                if !cur.can_write(4) {
                    return Ok(Progress::Suspended);
                }
                cur.put_u32(*v);
            }
            Part::Str(enc) => ready!(enc.encode(cur)),
            Part::Tick(enc) => ready!(enc.encode(cur)),
            Part::Ticks(enc) => ready!(enc.encode(cur)),
            Part::Payload {
                buffers,
                index,
                offset,
            } => {
                while let Some(buf) = buffers.get(*index) {
                    let left = buf.len() - *offset;
                    if left == 0 {
                        *index += 1;
                        *offset = 0;
                        continue;
                    }
                    let n = left.min(cur.room());
                    if n == 0 {
                        return Ok(Progress::Suspended);
                    }
                    cur.put_slice(&buf[*offset..*offset + n]);
                    *offset += n;
                }
            }
        }
        Ok(Progress::Done(()))
    }
}

/// Encodes one command into as many buffers as it takes.
#[derive(Debug)]
pub struct FrameEncoder {
    parts: Vec<Part>,
    next: usize,
}

impl FrameEncoder {
    pub fn new(command: &Command) -> Self {
        let mut parts = vec![Part::U8(command.opcode() as u8)];
        if let Some(resource) = command.resource() {
            parts.push(Part::str(resource));
        }
        match command {
            Command::Permission { permission, .. } => parts.push(Part::U8(permission.ordinal())),
            Command::OnKnown { ticks, .. } => parts.push(Part::Ticks(TickSetEncoder::new(ticks))),
            Command::GetBlock { tick, .. }
            | Command::CancelBlock { tick, .. }
            | Command::AckBlock { tick, .. } => parts.push(Part::Tick(TickEncoder::new(*tick))),
            Command::OnBlock { block, .. } => {
                parts.push(Part::Tick(TickEncoder::new(block.tick)));
                parts.push(Part::U32(block.len() as u32));
                parts.push(Part::Payload {
                    buffers: block.buffers.clone(),
                    index: 0,
                    offset: 0,
                });
                let removals = block.removals.clone().unwrap_or_default();
                parts.push(Part::Ticks(TickSetEncoder::new(&removals)));
                parts.push(Part::U8(block.requested as u8));
            }
            Command::Headers(pairs) => {
                for (key, value) in pairs {
                    parts.push(Part::str(key));
                    parts.push(Part::str(value));
                }
                parts.push(Part::Str(StringEncoder::new(None)));
            }
            Command::Address(addr) => {
                parts.push(Part::str(&addr.scheme));
                parts.push(Part::str(&addr.host));
                parts.push(Part::U16(addr.port));
            }
            Command::GetKnown { .. }
            | Command::Subscribe { .. }
            | Command::Unsubscribe { .. }
            | Command::Unresolved { .. } => {}
        }
        Self { parts, next: 0 }
    }

    /// Write as much of the frame as fits. `Done` once the whole frame is out.
    pub fn encode(&mut self, cur: &mut WriteCursor) -> Result<Progress<()>, CodecError> {
        while let Some(part) = self.parts.get_mut(self.next) {
            ready!(part.encode(cur));
            self.next += 1;
        }
        Ok(Progress::Done(()))
    }
}

/// Encode a command into one contiguous buffer.
pub fn encode_command(command: &Command) -> Result<Bytes, CodecError> {
    let mut cur = WriteCursor::unbounded();
    match FrameEncoder::new(command).encode(&mut cur)? {
        Progress::Done(()) => Ok(cur.take()),
        Progress::Suspended => Err(CodecError::Truncated),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Decodes a stream of frames, one command at a time.
///
/// Partially decoded state survives across calls, so input can arrive in
/// arbitrary splits. A decode error means the stream is unusable and the
/// connection should be torn down.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDecoder {
    max_block_len: u32,
    opcode: Option<Opcode>,
    resource: Option<String>,
    string: StringDecoder,
    tick_decoder: TickDecoder,
    tick: Option<Tick>,
    ticks: TickSetDecoder,
    block_len: Option<u32>,
    buffers: Vec<Bytes>,
    received: usize,
    removals: Option<TickSet>,
    pairs: Vec<(String, String)>,
    key: Option<String>,
    fields: Vec<String>,
}

impl CommandDecoder {
    pub fn new(max_block_len: u32) -> Self {
        Self {
            max_block_len,
            opcode: None,
            resource: None,
            string: StringDecoder::new(),
            tick_decoder: TickDecoder::new(),
            tick: None,
            ticks: TickSetDecoder::new(),
            block_len: None,
            buffers: Vec::new(),
            received: 0,
            removals: None,
            pairs: Vec::new(),
            key: None,
            fields: Vec::new(),
        }
    }

    /// Decode the next command, or suspend until more bytes arrive.
    pub fn decode(&mut self, cur: &mut ReadCursor) -> Result<Progress<Command>, CodecError> {
        let opcode = match self.opcode {
            Some(op) => op,
            None => {
                let op = Opcode::try_from(need!(cur.try_u8()))?;
                self.opcode = Some(op);
                op
            }
        };
        if opcode.is_resource_scoped() && self.resource.is_none() {
            let name = ready!(self.string.decode(cur)).ok_or(CodecError::UnexpectedNull)?;
            self.resource = Some(name);
        }

        let command = match opcode {
            Opcode::Permission => {
                let level = need!(cur.try_u8());
                let permission =
                    Permission::try_from(level).map_err(|_| CodecError::InvalidTag(level))?;
                Command::Permission {
                    resource: self.take_resource(),
                    permission,
                }
            }
            Opcode::GetKnown => Command::GetKnown {
                resource: self.take_resource(),
            },
            Opcode::OnKnown => {
                let ticks = ready!(self.ticks.decode(cur));
                Command::OnKnown {
                    resource: self.take_resource(),
                    ticks,
                }
            }
            Opcode::GetBlock => {
                let tick = ready!(self.tick_decoder.decode_required(cur));
                Command::GetBlock {
                    resource: self.take_resource(),
                    tick,
                }
            }
            Opcode::CancelBlock => {
                let tick = ready!(self.tick_decoder.decode_required(cur));
                Command::CancelBlock {
                    resource: self.take_resource(),
                    tick,
                }
            }
            Opcode::AckBlock => {
                let tick = ready!(self.tick_decoder.decode_required(cur));
                Command::AckBlock {
                    resource: self.take_resource(),
                    tick,
                }
            }
            Opcode::OnBlock => {
                let block = ready!(self.decode_block(cur));
                Command::OnBlock {
                    resource: self.take_resource(),
                    block,
                }
            }
            Opcode::Subscribe => Command::Subscribe {
                resource: self.take_resource(),
            },
            Opcode::Unsubscribe => Command::Unsubscribe {
                resource: self.take_resource(),
            },
            Opcode::Unresolved => Command::Unresolved {
                resource: self.take_resource(),
            },
            Opcode::Headers => ready!(self.decode_headers(cur)),
            Opcode::Address => ready!(self.decode_address(cur)),
        };

        *self = Self::new(self.max_block_len);
        Ok(Progress::Done(command))
    }

    fn take_resource(&mut self) -> String {
        self.resource.take().unwrap_or_default()
    }

    fn decode_block(&mut self, cur: &mut ReadCursor) -> Result<Progress<Block>, CodecError> {
        let tick = match self.tick {
            Some(tick) => tick,
            None => {
                let tick = ready!(self.tick_decoder.decode_required(cur));
                self.tick = Some(tick);
                tick
            }
        };
        let len = match self.block_len {
            Some(len) => len,
            None => {
                let len = need!(cur.try_u32());
                if len > self.max_block_len {
                    return Err(CodecError::LengthExceeded {
                        len: len as u64,
                        limit: self.max_block_len as u64,
                    });
                }
                self.block_len = Some(len);
                len
            }
        };
        while self.received < len as usize {
            let chunk = cur.take_up_to(len as usize - self.received);
            if chunk.is_empty() {
                return Ok(Progress::Suspended);
            }
            self.received += chunk.len();
            self.buffers.push(chunk);
        }
        if self.removals.is_none() {
            self.removals = Some(ready!(self.ticks.decode(cur)));
        }
        let requested = match need!(cur.try_u8()) {
            0 => false,
            1 => true,
            other => return Err(CodecError::InvalidTag(other)),
        };

        let block = Block {
            tick,
            buffers: std::mem::take(&mut self.buffers),
            removals: None,
            requested,
        };
        Ok(Progress::Done(
            block.with_removals(self.removals.take().unwrap_or_default()),
        ))
    }

    fn decode_headers(&mut self, cur: &mut ReadCursor) -> Result<Progress<Command>, CodecError> {
        loop {
            let value = ready!(self.string.decode(cur));
            match (value, self.key.take()) {
                (None, None) => {
                    return Ok(Progress::Done(Command::Headers(std::mem::take(
                        &mut self.pairs,
                    ))))
                }
                (None, Some(_)) => return Err(CodecError::UnexpectedNull),
                (Some(key), None) => self.key = Some(key),
                (Some(value), Some(key)) => self.pairs.push((key, value)),
            }
        }
    }

    fn decode_address(&mut self, cur: &mut ReadCursor) -> Result<Progress<Command>, CodecError> {
        while self.fields.len() < 2 {
            let field = ready!(self.string.decode(cur)).ok_or(CodecError::UnexpectedNull)?;
            self.fields.push(field);
        }
        let port = need!(cur.try_u16());
        let host = self.fields.pop().unwrap_or_default();
        let scheme = self.fields.pop().unwrap_or_default();
        Ok(Progress::Done(Command::Address(Address { scheme, host, port })))
    }
}
