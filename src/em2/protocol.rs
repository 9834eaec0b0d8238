use crate::error::Em2Error;
use log::debug;

// Protocol constants
pub const COMMAND_TERMINATOR: &str = ";\n";
pub const SEGMENT_SEPARATOR: char = ';';
pub const LINE_END: u8 = b'\n';
pub const RECV_CHUNK_SIZE: usize = 8096;
pub const SEND_ATTEMPTS: usize = 2;
pub const RECV_ATTEMPTS: usize = 5;

/// Low-level helpers for the EM2 ASCII protocol
pub struct Protocol;

impl Protocol {
    /// Frame a command for transmission: `<COMMAND>;\n`
    pub fn frame_command(command: &str) -> Vec<u8> {
        let mut frame = Vec::with_capacity(command.len() + COMMAND_TERMINATOR.len());
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(COMMAND_TERMINATOR.as_bytes());
        frame
    }

    /// A response is complete once the last received byte is a newline.
    pub fn is_complete(buffer: &[u8]) -> bool {
        buffer.last() == Some(&LINE_END)
    }

    /// Extract the authoritative answer from a complete response line.
    ///
    /// The instrument may prepend error notifications separated by `;` to the
    /// real answer, so only the final non-empty segment is kept. The line
    /// terminator (`\r\n` or `\n`) is stripped.
    pub fn extract_answer(raw: &str) -> String {
        let line = raw.trim_end_matches(['\n', '\r']);
        let segments: Vec<&str> = line.split(SEGMENT_SEPARATOR).collect();
        if segments.len() > 1 {
            debug!("Discarding {} leading segment(s) of {:?}", segments.len() - 1, raw);
        }
        segments
            .iter()
            .rev()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or("")
            .to_string()
    }

    /// Instrument-side failures are reported as `ERROR...` answers.
    pub fn check_error(command: &str, answer: &str) -> Result<(), Em2Error> {
        if answer.to_uppercase().starts_with("ERROR") {
            let message = answer
                .split_once(' ')
                .map(|(_, rest)| rest)
                .unwrap_or(answer)
                .to_string();
            return Err(Em2Error::Instrument {
                command: command.to_string(),
                message,
            });
        }
        Ok(())
    }

    pub fn parse_f64(command: &str, answer: &str) -> Result<f64, Em2Error> {
        answer.trim().parse::<f64>().map_err(|_| {
            Em2Error::Protocol(format!("'{command}' returned non-numeric answer '{answer}'"))
        })
    }

    pub fn parse_u64(command: &str, answer: &str) -> Result<u64, Em2Error> {
        let text = answer.trim();
        text.parse::<u64>()
            .or_else(|_| match text.parse::<f64>() {
                Ok(v) if v >= 0.0 && v.fract() == 0.0 => Ok(v as u64),
                _ => Err(()),
            })
            .map_err(|_| {
                Em2Error::Protocol(format!("'{command}' returned non-integer answer '{answer}'"))
            })
    }

    /// Map the instrument's `On`/`Off` tokens to a flag.
    pub fn parse_on_off(command: &str, answer: &str) -> Result<bool, Em2Error> {
        match answer.trim().to_lowercase().as_str() {
            "on" | "1" | "true" => Ok(true),
            "off" | "0" | "false" => Ok(false),
            _ => Err(Em2Error::Protocol(format!(
                "'{command}' returned '{answer}', expected On/Off"
            ))),
        }
    }

    pub fn on_off(flag: bool) -> &'static str {
        if flag { "On" } else { "Off" }
    }

    /// Parse an `ACQU:MEAS?` answer.
    ///
    /// The instrument answers with a nested list literal of `(name, values)`
    /// pairs, e.g. `[['CHAN01', [1.0, 2.0]], ['CHAN02', [3.0, 4.0]]]`. Both list
    /// and tuple brackets are accepted.
    pub fn parse_measurement(answer: &str) -> Result<Vec<(String, Vec<f64>)>, Em2Error> {
        let mut parser = LiteralParser::new(answer);
        let pairs = parser.measurement()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("trailing characters"));
        }
        Ok(pairs)
    }
}

struct LiteralParser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, what: &str) -> Em2Error {
        Em2Error::Protocol(format!(
            "Malformed measurement data ({what} at offset {}): {}",
            self.pos,
            preview(self.text)
        ))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn open(&mut self) -> Result<u8, Em2Error> {
        match self.peek() {
            Some(b'[') => {
                self.pos += 1;
                Ok(b']')
            }
            Some(b'(') => {
                self.pos += 1;
                Ok(b')')
            }
            _ => Err(self.error("expected '[' or '('")),
        }
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Parse `open item (, item)* [,] close`
    fn sequence<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, Em2Error>,
    ) -> Result<Vec<T>, Em2Error> {
        let close = self.open()?;
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok(items);
            }
            items.push(item(self)?);
            if !self.eat(b',') {
                if self.eat(close) {
                    return Ok(items);
                }
                return Err(self.error("expected ',' or closing bracket"));
            }
        }
    }

    fn measurement(&mut self) -> Result<Vec<(String, Vec<f64>)>, Em2Error> {
        self.sequence(|p| {
            let close = p.open()?;
            let name = p.string()?;
            if !p.eat(b',') {
                return Err(p.error("expected ',' after channel name"));
            }
            let values = p.sequence(|p| p.number())?;
            p.eat(b',');
            if !p.eat(close) {
                return Err(p.error("expected end of channel entry"));
            }
            Ok((name, values))
        })
    }

    fn string(&mut self) -> Result<String, Em2Error> {
        let quote = match self.peek() {
            Some(q @ (b'\'' | b'"')) => q,
            _ => return Err(self.error("expected quoted channel name")),
        };
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != quote {
            self.pos += 1;
        }
        if self.at_end() {
            return Err(self.error("unterminated string"));
        }
        let name = self.text[start..self.pos].to_string();
        self.pos += 1;
        Ok(name)
    }

    fn number(&mut self) -> Result<f64, Em2Error> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len()
            && matches!(self.bytes[self.pos], b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E' | b'a'..=b'z')
        {
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        text.parse::<f64>()
            .map_err(|_| self.error(&format!("invalid number '{text}'")))
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let cut = (0..=MAX).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
        format!("{}...", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_command() {
        assert_eq!(Protocol::frame_command("ACQU:STAT?"), b"ACQU:STAT?;\n".to_vec());
    }

    #[test]
    fn test_completion_requires_trailing_newline() {
        assert!(!Protocol::is_complete(b""));
        assert!(!Protocol::is_complete(b"STATE_ON\r"));
        assert!(!Protocol::is_complete(b"12\n3"));
        assert!(Protocol::is_complete(b"STATE_ON\r\n"));
    }

    #[test]
    fn test_extract_last_segment() {
        assert_eq!(Protocol::extract_answer("ERR:OVERFLOW;42.0\n"), "42.0");
        assert_eq!(Protocol::extract_answer("STATE_ON\r\n"), "STATE_ON");
        assert_eq!(Protocol::extract_answer("ERR:A;ERR:B;7\r\n"), "7");
        assert_eq!(Protocol::extract_answer("ACK;\n"), "ACK");
        assert_eq!(Protocol::extract_answer("\n"), "");
    }

    #[test]
    fn test_check_error() {
        assert!(Protocol::check_error("X", "42.0").is_ok());
        match Protocol::check_error("ACQU:TIME -1", "ERROR: value out of range") {
            Err(Em2Error::Instrument { command, message }) => {
                assert_eq!(command, "ACQU:TIME -1");
                assert_eq!(message, "value out of range");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_numeric_answers() {
        assert_eq!(Protocol::parse_u64("ACQU:NDAT?", "10").unwrap(), 10);
        assert_eq!(Protocol::parse_u64("ACQU:NDAT?", "10.0").unwrap(), 10);
        assert!(Protocol::parse_u64("ACQU:NDAT?", "-1").is_err());
        assert_eq!(Protocol::parse_f64("CHAN01:INSC?", "1.5e-09").unwrap(), 1.5e-9);
        assert!(Protocol::parse_f64("CHAN01:INSC?", "abc").is_err());
    }

    #[test]
    fn test_on_off() {
        assert!(Protocol::parse_on_off("INVE?", "On").unwrap());
        assert!(!Protocol::parse_on_off("INVE?", "OFF").unwrap());
        assert!(Protocol::parse_on_off("INVE?", "maybe").is_err());
        assert_eq!(Protocol::on_off(true), "On");
    }

    #[test]
    fn test_parse_measurement_lists_and_tuples() {
        let data = Protocol::parse_measurement(
            "[['CHAN01', [1.0, 2.5]], ('CHAN02', (-3e-06, 4,)), [\"CHAN03\", []]]",
        )
        .unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0], ("CHAN01".to_string(), vec![1.0, 2.5]));
        assert_eq!(data[1], ("CHAN02".to_string(), vec![-3e-6, 4.0]));
        assert_eq!(data[2], ("CHAN03".to_string(), vec![]));
    }

    #[test]
    fn test_parse_measurement_rejects_garbage() {
        assert!(Protocol::parse_measurement("").is_err());
        assert!(Protocol::parse_measurement("[['CHAN01', [1.0, 2.0]]").is_err());
        assert!(Protocol::parse_measurement("[['CHAN01' [1.0]]]").is_err());
        assert!(Protocol::parse_measurement("[['CHAN01', [x]]]").is_err());
        assert!(Protocol::parse_measurement("[] extra").is_err());
    }
}
