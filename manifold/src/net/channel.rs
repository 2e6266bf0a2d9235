use crate::logging;
use crate::message::{Message, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use crate::net::buffer::Buffer;
use crate::support::{BusError, BusResult, ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use mio::net::TcpStream;
use std::net::Shutdown;
use std::time::{Duration, Instant};

// Slack past the outgoing quota so the pre-reserved out-of-memory reply can
// always be queued even when the quota itself is exhausted.
const OOB_HEADROOM: usize = 4096;

/// Peer credentials, when the transport can determine them. The TCP
/// transport cannot; a future unix-socket transport fills them in from
/// SO_PEERCRED at accept time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Credentials {
    pub uid: u32,
    pub pid: u32,
}

/// Lifecycle state of a channel. A connection may only talk to the driver
/// until its Hello assigns a unique name and flips it to `Active`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelState {
    AuthPending(Instant),
    Active(String),
    Disconnected,
}

/// A non-blocking stream channel carrying length-prefixed message frames.
/// Incoming bytes accumulate in a bounded read buffer and are popped one
/// parsed message at a time; outgoing messages are serialized into a
/// bounded write buffer whose quota is claimed up front (`reserve`) so
/// that committing a transaction can never run out of room.
pub struct Channel {
    stream: Option<TcpStream>,
    state: ChannelState,

    read_buffer: Buffer,
    write_buffer: Buffer,

    // Outgoing quota claimed by open transactions but not yet serialized.
    reserved: usize,
    max_outgoing: usize,

    last_ingress: Instant,
    last_egress: Instant,

    credentials: Option<Credentials>,

    log: logging::Logger,
}

impl Channel {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        max_incoming: usize,
        max_outgoing: usize,
        log: L,
    ) -> Channel {
        let now = Instant::now();

        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        Channel {
            stream: None,
            state: ChannelState::Disconnected,
            read_buffer: Buffer::new(max_incoming),
            write_buffer: Buffer::new(max_outgoing + OOB_HEADROOM),
            reserved: 0,
            max_outgoing,
            last_ingress: now,
            last_egress: now,
            credentials: None,
            log: channel_log,
        }
    }

    /// Opens the channel on a freshly accepted stream. The channel must be
    /// closed for this operation to succeed.
    pub fn open(&mut self, stream: TcpStream, now: Instant) {
        if self.state != ChannelState::Disconnected {
            panic!("Attempted to open an already open channel");
        }

        self.state = ChannelState::AuthPending(now);
        self.stream = Some(stream);
        self.last_ingress = now;
        self.last_egress = now;

        logging::debug!(self.log, "channel opened"; "context" => "open");
    }

    /// Closes the channel and the underlying stream and clears all queues.
    pub fn close(&mut self) {
        if self.state == ChannelState::Disconnected {
            return;
        }

        logging::debug!(self.log, "closing channel";
                        "context" => "close",
                        "read_size" => self.read_buffer.len(),
                        "write_size" => self.write_buffer.len());

        // Best-effort flush of already queued replies before the shutdown.
        if let Some(stream) = self.stream.as_ref() {
            drop(self.write_buffer.egress(stream));
        }

        self.read_buffer.clear();
        self.write_buffer.clear();
        self.reserved = 0;
        self.state = ChannelState::Disconnected;

        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(Shutdown::Both));
        }
    }

    /// Transition from AuthPending to Active under the given unique name.
    pub fn mark_active(&mut self, unique_name: &str) {
        match self.state {
            ChannelState::AuthPending(_) => {
                self.state = ChannelState::Active(unique_name.to_string());
            }
            _ => panic!("Channel must be auth-pending to activate"),
        }
    }

    #[inline]
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        match self.state {
            ChannelState::Active(_) => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.state == ChannelState::Disconnected
    }

    /// Unique name of an Active channel.
    #[inline]
    pub fn unique_name(&self) -> Option<&str> {
        match self.state {
            ChannelState::Active(ref name) => Some(name),
            _ => None,
        }
    }

    #[inline]
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials
    }

    #[inline]
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    /// Time elapsed since the channel last produced ingress bytes.
    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    #[inline]
    pub fn last_egress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_egress)
    }

    /// Returns true if there is outgoing data waiting on the channel.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Registers this channel on the supplied poll.
    pub fn register(&self, token: mio::Token, poll: &mio::Poll, ready: mio::Ready) -> NetworkResult<()> {
        let stream = self.stream.as_ref().expect("Can't register disconnected channel");

        poll.register(stream, token, ready, mio::PollOpt::level())
            .map_err(Into::into)
    }

    /// Adjusts the interest mask of an already registered channel. A
    /// channel without a stream has nothing registered and is a no-op.
    pub fn reregister(&self, token: mio::Token, poll: &mio::Poll, ready: mio::Ready) -> NetworkResult<()> {
        match self.stream.as_ref() {
            Some(stream) => poll
                .reregister(stream, token, ready, mio::PollOpt::level())
                .map_err(Into::into),
            None => Ok(()),
        }
    }

    /// Deregisters this channel from the supplied poll.
    pub fn deregister(&self, poll: &mio::Poll) -> NetworkResult<()> {
        match self.stream.as_ref() {
            Some(stream) => poll.deregister(stream).map_err(Into::into),
            None => Ok(()),
        }
    }

    /// Read all available data off the network. A `Fatal(Closed)` result
    /// means the peer hung up; frames buffered before the close are still
    /// poppable and must be drained before teardown.
    pub fn receive(&mut self, now: Instant) -> NetworkResult<usize> {
        let stream = self.stream.as_ref().expect("Channel must have valid stream");

        let received = self.read_buffer.ingress(stream)?;

        if received > 0 {
            self.last_ingress = now;
        }

        Ok(received)
    }

    /// Flush buffered outgoing data to the network. Without a stream the
    /// data just stays queued (exercised by the in-memory test rigs).
    pub fn send(&mut self, now: Instant) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return Ok(0),
        };
        let sent = self.write_buffer.egress(stream)?;

        if sent > 0 {
            self.last_egress = now;
        }

        Ok(sent)
    }

    /// Parse one complete frame off the read buffer, if present.
    pub fn pop_message(&mut self) -> NetworkResult<Option<Message>> {
        let (consumed, msg) = {
            let slice = self.read_buffer.read_slice();

            if slice.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let body_len = BigEndian::read_u32(&slice[..FRAME_HEADER_SIZE]) as usize;

            if body_len > MAX_FRAME_SIZE {
                return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
            }

            if slice.len() < FRAME_HEADER_SIZE + body_len {
                return Ok(None);
            }

            let msg = Message::decode(&slice[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + body_len])?;

            (FRAME_HEADER_SIZE + body_len, msg)
        };

        self.read_buffer.consume(consumed);

        Ok(Some(msg))
    }

    /// Quota currently committed to queued or staged outgoing data.
    #[inline]
    pub fn outgoing_load(&self) -> usize {
        self.write_buffer.len() + self.reserved
    }

    /// Claim `bytes` of outgoing quota for a staged send. Fails when the
    /// quota is exhausted; the failure is what the routing core reports as
    /// memory exhaustion on this connection.
    pub fn reserve(&mut self, bytes: usize) -> BusResult<()> {
        if self.outgoing_load() + bytes > self.max_outgoing {
            logging::debug!(self.log, "outgoing quota exhausted";
                            "context" => "reserve",
                            "queued" => self.write_buffer.len(),
                            "reserved" => self.reserved,
                            "wanted" => bytes);
            return Err(BusError::no_memory());
        }

        self.reserved += bytes;
        Ok(())
    }

    /// Return quota claimed by `reserve` without queuing anything.
    #[inline]
    pub fn unreserve(&mut self, bytes: usize) {
        debug_assert!(self.reserved >= bytes);
        self.reserved -= bytes;
    }

    /// Serialize a message whose size was previously claimed by `reserve`.
    /// The reservation guarantees buffer room, so failure here means the
    /// frame itself is unencodable and the channel is torn down.
    pub fn queue_reserved(&mut self, msg: &Message) -> NetworkResult<()> {
        let size = msg.wire_size();
        debug_assert!(self.reserved >= size);
        self.reserved -= size;

        let frame = msg.encode()?;
        self.write_buffer.extend(&frame)
    }

    /// Serialize a message outside the quota, into the headroom kept for
    /// failure replies. Used only for the pre-reserved OOM error.
    pub fn queue_oob(&mut self, msg: &Message) -> NetworkResult<()> {
        let frame = msg.encode()?;
        self.write_buffer.extend(&frame)
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn read_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.read_buffer
    }

    #[cfg(test)]
    pub(crate) fn write_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.write_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Arg;
    use crate::{DRIVER_INTERFACE, DRIVER_NAME};

    const MAX_IN: usize = 65536;
    const MAX_OUT: usize = 65536;

    fn test_channel() -> Channel {
        Channel::new(MAX_IN, MAX_OUT, None)
    }

    fn sample_message() -> Message {
        let mut msg = Message::method_call(DRIVER_NAME, DRIVER_INTERFACE, "RequestName")
            .with_arg(Arg::Str("org.example.Echo".to_string()))
            .with_arg(Arg::U32(0));
        msg.serial = 11;
        msg
    }

    #[test]
    fn test_pop_message_roundtrip() {
        let mut channel = test_channel();
        let msg = sample_message();

        channel.read_buffer_mut().extend(&msg.encode().unwrap()).unwrap();

        let popped = channel.pop_message().unwrap().unwrap();
        assert_eq!(popped, msg);
        assert!(channel.pop_message().unwrap().is_none());
    }

    #[test]
    fn test_pop_message_partial_frame() {
        let mut channel = test_channel();
        let frame = sample_message().encode().unwrap();

        channel.read_buffer_mut().extend(&frame[..frame.len() - 3]).unwrap();
        assert!(channel.pop_message().unwrap().is_none());

        channel.read_buffer_mut().extend(&frame[frame.len() - 3..]).unwrap();
        assert!(channel.pop_message().unwrap().is_some());
    }

    #[test]
    fn test_pop_message_two_frames_one_read() {
        let mut channel = test_channel();
        let first = sample_message();
        let mut second = sample_message();
        second.serial = 12;

        channel.read_buffer_mut().extend(&first.encode().unwrap()).unwrap();
        channel.read_buffer_mut().extend(&second.encode().unwrap()).unwrap();

        assert_eq!(channel.pop_message().unwrap().unwrap().serial, 11);
        assert_eq!(channel.pop_message().unwrap().unwrap().serial, 12);
        assert!(channel.pop_message().unwrap().is_none());
    }

    #[test]
    fn test_pop_message_oversized_frame() {
        let mut channel = test_channel();

        let mut header = [0u8; FRAME_HEADER_SIZE];
        BigEndian::write_u32(&mut header, (MAX_FRAME_SIZE + 1) as u32);
        channel.read_buffer_mut().extend(&header).unwrap();

        let result = channel.pop_message();
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::FrameTooLarge));
    }

    #[test]
    fn test_reserve_commit_cycle() {
        let mut channel = test_channel();
        let msg = sample_message();
        let size = msg.wire_size();

        channel.reserve(size).unwrap();
        assert_eq!(channel.outgoing_load(), size);

        channel.queue_reserved(&msg).unwrap();
        assert_eq!(channel.outgoing_load(), size);
        assert!(channel.has_egress());

        // The queued frame parses back to the same message.
        let queued = channel.write_buffer_mut().read_slice().to_vec();
        assert_eq!(
            Message::decode(&queued[FRAME_HEADER_SIZE..]).unwrap(),
            msg
        );
    }

    #[test]
    fn test_reserve_quota_exhaustion() {
        let mut channel = Channel::new(MAX_IN, 64, None);

        channel.reserve(60).unwrap();
        let err = channel.reserve(8).unwrap_err();
        assert_eq!(err.kind(), crate::support::ErrorKind::NoMemory);

        channel.unreserve(60);
        channel.reserve(8).unwrap();
    }

    #[test]
    fn test_queue_oob_bypasses_quota() {
        let mut channel = Channel::new(MAX_IN, 16, None);
        channel.reserve(16).unwrap();

        // Quota is gone, but the failure reply still fits in the headroom.
        let msg = sample_message();
        channel.queue_oob(&msg).unwrap();
        assert!(channel.has_egress());
    }

    #[test]
    fn test_state_transitions() {
        let mut channel = test_channel();
        assert!(channel.is_disconnected());
        assert_eq!(channel.unique_name(), None);

        // No real stream in unit tests; exercise the state machine alone.
        channel.state = ChannelState::AuthPending(Instant::now());
        assert!(!channel.is_active());

        channel.mark_active(":1.0");
        assert!(channel.is_active());
        assert_eq!(channel.unique_name(), Some(":1.0"));
    }

    #[test]
    #[should_panic(expected = "Channel must be auth-pending to activate")]
    fn test_mark_active_requires_auth_pending() {
        let mut channel = test_channel();
        channel.mark_active(":1.0");
    }

    #[test]
    fn test_close_is_idempotent_without_stream() {
        let mut channel = test_channel();
        channel.state = ChannelState::Active(":1.0".to_string());
        channel.reserve(10).unwrap();

        channel.close();
        assert!(channel.is_disconnected());
        assert_eq!(channel.outgoing_load(), 0);

        channel.close();
        assert!(channel.is_disconnected());
    }
}
