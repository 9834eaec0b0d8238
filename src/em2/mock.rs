//! Scripted stand-in for the electrometer socket, used by unit tests.

use super::transport::{Connector, Transport};
use crate::error::Em2Error;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

/// What the simulated instrument does with one received command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Queue these bytes for reading (terminator included).
    Line(String),
    /// Answer nothing; reads will time out.
    Silent,
    /// Close the stream; reads return end-of-stream.
    Close,
}

pub trait Responder: Send {
    fn respond(&mut self, command: &str) -> Reply;
}

impl<F> Responder for F
where
    F: FnMut(&str) -> Reply + Send,
{
    fn respond(&mut self, command: &str) -> Reply {
        self(command)
    }
}

struct MockState {
    responder: Box<dyn Responder>,
    pending: VecDeque<u8>,
    closed: bool,
    send_timeouts: usize,
    recv_timeouts: usize,
    chunk: usize,
    connects: usize,
    sent: Vec<String>,
}

/// Handle shared by the connector and the test body.
#[derive(Clone)]
pub struct MockInstrument {
    state: Arc<Mutex<MockState>>,
}

impl MockInstrument {
    pub fn new(responder: impl Responder + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responder: Box::new(responder),
                pending: VecDeque::new(),
                closed: false,
                send_timeouts: 0,
                recv_timeouts: 0,
                chunk: usize::MAX,
                connects: 0,
                sent: Vec::new(),
            })),
        }
    }

    /// Simulated EM2 with default settings.
    pub fn em2() -> (Self, Arc<Mutex<FakeEm2>>) {
        let fake = Arc::new(Mutex::new(FakeEm2::default()));
        (Self::new(FakeResponder(Arc::clone(&fake))), fake)
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(MockConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// Make the next `n` writes time out.
    pub fn fail_sends(&self, n: usize) {
        self.state.lock().send_timeouts = n;
    }

    /// Make the next `n` reads time out.
    pub fn fail_recvs(&self, n: usize) {
        self.state.lock().recv_timeouts = n;
    }

    /// Deliver answers in pieces of at most `n` bytes.
    pub fn chunked(&self, n: usize) {
        self.state.lock().chunk = n.max(1);
    }

    /// Injected write failures not consumed yet.
    pub fn pending_send_failures(&self) -> usize {
        self.state.lock().send_timeouts
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Every framed command that reached the instrument, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Sent commands without their terminator.
    pub fn commands(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|s| s.trim_end_matches(";\n").to_string())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }
}

struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Box<dyn Transport>, Em2Error> {
        let mut state = self.state.lock();
        state.connects += 1;
        // a new connection never sees bytes meant for the old one
        state.pending.clear();
        state.closed = false;
        Ok(Box::new(MockTransport {
            state: Arc::clone(&self.state),
        }))
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }
}

struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.send_timeouts > 0 {
            state.send_timeouts -= 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock send timeout"));
        }
        let framed = String::from_utf8_lossy(data).to_string();
        state.sent.push(framed.clone());
        let command = framed.trim_end_matches(";\n").to_string();
        match state.responder.respond(&command) {
            Reply::Line(line) => state.pending.extend(line.into_bytes()),
            Reply::Silent => {}
            Reply::Close => state.closed = true,
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.recv_timeouts > 0 {
            state.recv_timeouts -= 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock recv timeout"));
        }
        if state.pending.is_empty() {
            if state.closed {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "mock: nothing to read"));
        }
        let n = buf.len().min(state.chunk).min(state.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.pending.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

/// In-memory model of the EM2 command set.
#[derive(Debug, Clone)]
pub struct FakeEm2 {
    /// Status answers; the last one repeats forever.
    pub status: VecDeque<String>,
    /// Ready counts; the last one repeats forever.
    pub ready: VecDeque<u64>,
    /// Offset added to every sample so channels can be told apart.
    pub channel_offsets: Vec<f64>,
    pub range: Vec<String>,
    pub inversion: Vec<bool>,
    pub instant_current: f64,
    pub mode: String,
    pub acquisition_time: Option<String>,
    pub triggers: Option<String>,
    pub trigger_mode: Option<String>,
    pub trigger_input: Option<String>,
    /// Prepended as an extra `;` segment to every answer.
    pub error_prefix: Option<String>,
}

impl Default for FakeEm2 {
    fn default() -> Self {
        Self {
            status: VecDeque::from(vec!["STATE_ON".to_string()]),
            ready: VecDeque::from(vec![0]),
            channel_offsets: vec![100.0, 200.0, 300.0, 400.0],
            range: vec!["1mA".to_string(); 4],
            inversion: vec![false; 4],
            instant_current: 1.5e-9,
            mode: "CURRENT".to_string(),
            acquisition_time: None,
            triggers: None,
            trigger_mode: None,
            trigger_input: None,
            error_prefix: None,
        }
    }
}

impl FakeEm2 {
    pub fn set_status(&mut self, answers: &[&str]) {
        self.status = answers.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_ready(&mut self, counts: &[u64]) {
        self.ready = counts.iter().copied().collect();
    }

    fn next_status(&mut self) -> String {
        if self.status.len() > 1 {
            self.status.pop_front().unwrap_or_default()
        } else {
            self.status.front().cloned().unwrap_or_default()
        }
    }

    fn next_ready(&mut self) -> u64 {
        if self.ready.len() > 1 {
            self.ready.pop_front().unwrap_or_default()
        } else {
            self.ready.front().copied().unwrap_or_default()
        }
    }

    /// Sample `n` of a channel; numbering follows the `MEAS?` offset.
    pub fn sample(&self, channel: usize, n: i64) -> f64 {
        self.channel_offsets[channel] + n as f64
    }

    fn measurement(&self, args: &str) -> String {
        let (offset, count) = args.split_once(',').unwrap_or((args, "1"));
        let offset: i64 = offset.trim().parse().unwrap_or(0);
        let count: i64 = count.trim().parse().unwrap_or(1);
        let channels: Vec<String> = (0..self.channel_offsets.len())
            .map(|ch| {
                let values: Vec<String> = (0..count)
                    .map(|i| format!("{:?}", self.sample(ch, offset + 1 + i)))
                    .collect();
                format!("['CHAN{:02}', [{}]]", ch + 1, values.join(", "))
            })
            .collect();
        format!("[{}]", channels.join(", "))
    }

    fn channel_command(&mut self, command: &str) -> Option<String> {
        let rest = command.strip_prefix("CHAN")?;
        let index: usize = rest.get(..2)?.parse().ok()?;
        let channel = index.checked_sub(1)?;
        let sub = rest.get(2..)?;
        Some(match sub.split_once(' ') {
            None if sub == ":CABO:RANGE?" => self.range.get(channel)?.clone(),
            None if sub == ":CABO:INVE?" => {
                let on = *self.inversion.get(channel)?;
                (if on { "On" } else { "Off" }).to_string()
            }
            None if sub.starts_with(":INSC") => format!("{:?}", self.instant_current),
            Some((":CABO:RANGE", value)) => {
                *self.range.get_mut(channel)? = value.to_string();
                "ACK".to_string()
            }
            Some((":CABO:INVE", value)) => {
                *self.inversion.get_mut(channel)? = value.eq_ignore_ascii_case("on");
                "ACK".to_string()
            }
            _ => return None,
        })
    }

    fn answer(&mut self, command: &str) -> String {
        let (head, args) = command.split_once(' ').unwrap_or((command, ""));
        match head {
            "ACQU:STAT?" => self.next_status(),
            "ACQU:NDAT?" => self.next_ready().to_string(),
            "ACQU:MEAS?" => self.measurement(args),
            "ACQU:MODE?" => self.mode.clone(),
            "ACQU:MODE" => {
                self.mode = args.to_string();
                "ACK".to_string()
            }
            "ACQU:TIME" => {
                self.acquisition_time = Some(args.to_string());
                "ACK".to_string()
            }
            "ACQU:NTRI" => {
                self.triggers = Some(args.to_string());
                "ACK".to_string()
            }
            "TRIG:MODE" => {
                self.trigger_mode = Some(args.to_string());
                "ACK".to_string()
            }
            "TRIG:INPU" => {
                self.trigger_input = Some(args.to_string());
                "ACK".to_string()
            }
            "ACQU:START" | "ACQU:STOP" | "TMST" => "ACK".to_string(),
            _ => self
                .channel_command(command)
                .unwrap_or_else(|| "ERROR: unknown command".to_string()),
        }
    }
}

struct FakeResponder(Arc<Mutex<FakeEm2>>);

impl Responder for FakeResponder {
    fn respond(&mut self, command: &str) -> Reply {
        let mut fake = self.0.lock();
        let answer = fake.answer(command);
        let line = match &fake.error_prefix {
            Some(prefix) => format!("{prefix};{answer}\r\n"),
            None => format!("{answer}\r\n"),
        };
        Reply::Line(line)
    }
}
