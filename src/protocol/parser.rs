// ABOUTME: Streaming parser for inbound Carabiner messages
// ABOUTME: Tokenizes `symbol { :key value ... }` sequences from read buffers

use crate::protocol::messages::Event;

/// Decode as many complete messages as `input` holds.
///
/// Returns the parsed events along with the number of bytes consumed. A
/// partial trailing message is left unconsumed so the caller can retry once
/// more bytes arrive. Messages with unknown opening symbols are logged and
/// skipped; irrecoverably malformed input is logged and the rest of the
/// buffer dropped.
pub fn decode(input: &str) -> (Vec<Event>, usize) {
    let mut events = Vec::new();
    let mut lexer = Lexer::new(input);
    loop {
        lexer.skip_whitespace();
        let checkpoint = lexer.pos;
        match parse_message(&mut lexer) {
            Ok(Parsed::Eof) => return (events, lexer.pos),
            Ok(Parsed::Event(event)) => events.push(event),
            Ok(Parsed::Ignored) => {}
            Err(ParseError::Incomplete) => return (events, checkpoint),
            Err(ParseError::Malformed(reason)) => {
                log::warn!("Discarding unparseable data from Carabiner: {reason}");
                return (events, input.len());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Symbol(String),
    Keyword(String),
    Int(i64),
    Float(f64),
    Str(String),
    OpenBrace,
    CloseBrace,
}

#[derive(Debug)]
enum ParseError {
    /// The buffer ends in the middle of a message
    Incomplete,
    /// The buffer cannot be parsed as protocol messages
    Malformed(String),
}

enum Parsed {
    Eof,
    Event(Event),
    Ignored,
}

fn parse_message(lexer: &mut Lexer<'_>) -> Result<Parsed, ParseError> {
    let symbol = match lexer.next_token()? {
        None => return Ok(Parsed::Eof),
        Some(Token::Symbol(symbol)) => symbol,
        Some(other) => {
            return Err(ParseError::Malformed(format!(
                "expected a message symbol, found {other:?}"
            )))
        }
    };
    match symbol.as_str() {
        "status" => {
            let map = parse_map(lexer)?;
            match (float_field(&map, "bpm"), int_field(&map, "peers")) {
                (Some(bpm), Some(peers)) => Ok(Parsed::Event(Event::Status {
                    bpm,
                    peers: peers.max(0) as u64,
                })),
                _ => {
                    log::warn!("Ignoring status message missing :bpm or :peers");
                    Ok(Parsed::Ignored)
                }
            }
        }
        "beat-at-time" => {
            let map = parse_map(lexer)?;
            match (float_field(&map, "beat"), int_field(&map, "when")) {
                (Some(beat), Some(when)) => Ok(Parsed::Event(Event::BeatAtTime { beat, when })),
                _ => {
                    log::warn!("Ignoring beat-at-time response missing :beat or :when");
                    Ok(Parsed::Ignored)
                }
            }
        }
        "phase-at-time" => {
            let map = parse_map(lexer)?;
            match (float_field(&map, "phase"), int_field(&map, "when")) {
                (Some(phase), Some(when)) => Ok(Parsed::Event(Event::PhaseAtTime { phase, when })),
                _ => {
                    log::warn!("Ignoring phase-at-time response missing :phase or :when");
                    Ok(Parsed::Ignored)
                }
            }
        }
        "version" => match lexer.next_token()? {
            Some(Token::Str(version)) => Ok(Parsed::Event(Event::Version(version))),
            Some(other) => Err(ParseError::Malformed(format!(
                "expected a version string, found {other:?}"
            ))),
            None => Err(ParseError::Incomplete),
        },
        "unsupported" => match lexer.next_token()? {
            Some(Token::Symbol(command)) => Ok(Parsed::Event(Event::Unsupported(command))),
            Some(other) => Err(ParseError::Malformed(format!(
                "expected a command symbol, found {other:?}"
            ))),
            None => Err(ParseError::Incomplete),
        },
        _ => {
            // Consume an attached map payload so parsing can resync on the
            // next message
            if matches!(lexer.peek_token()?, Some(Token::OpenBrace)) {
                parse_map(lexer)?;
            }
            log::warn!("Skipping unrecognized message from Carabiner: {symbol}");
            Ok(Parsed::Ignored)
        }
    }
}

/// Numeric map value; other value types are tolerated but not retained.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    fn as_f64(self) -> f64 {
        match self {
            Value::Int(value) => value as f64,
            Value::Float(value) => value,
        }
    }
}

fn parse_map(lexer: &mut Lexer<'_>) -> Result<Vec<(String, Value)>, ParseError> {
    match lexer.next_token()? {
        Some(Token::OpenBrace) => {}
        Some(other) => {
            return Err(ParseError::Malformed(format!(
                "expected a map payload, found {other:?}"
            )))
        }
        None => return Err(ParseError::Incomplete),
    }
    let mut pairs = Vec::new();
    loop {
        match lexer.next_token()? {
            Some(Token::CloseBrace) => return Ok(pairs),
            Some(Token::Keyword(key)) => match lexer.next_token()? {
                Some(Token::Int(value)) => pairs.push((key, Value::Int(value))),
                Some(Token::Float(value)) => pairs.push((key, Value::Float(value))),
                Some(Token::Str(_)) | Some(Token::Symbol(_)) => {}
                Some(other) => {
                    return Err(ParseError::Malformed(format!(
                        "unexpected map value {other:?}"
                    )))
                }
                None => return Err(ParseError::Incomplete),
            },
            Some(other) => {
                return Err(ParseError::Malformed(format!(
                    "expected a map key, found {other:?}"
                )))
            }
            None => return Err(ParseError::Incomplete),
        }
    }
}

fn field(map: &[(String, Value)], name: &str) -> Option<Value> {
    map.iter().find(|(key, _)| key == name).map(|(_, value)| *value)
}

fn float_field(map: &[(String, Value)], name: &str) -> Option<f64> {
    field(map, name).map(Value::as_f64)
}

fn int_field(map: &[(String, Value)], name: &str) -> Option<i64> {
    match field(map, name) {
        Some(Value::Int(value)) => Some(value),
        _ => None,
    }
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_token(&mut self) -> Result<Option<Token>, ParseError> {
        let saved = self.pos;
        let token = self.next_token();
        self.pos = saved;
        token
    }

    fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
        self.skip_whitespace();
        let Some(c) = self.peek_char() else {
            return Ok(None);
        };
        match c {
            '{' => {
                self.pos += 1;
                Ok(Some(Token::OpenBrace))
            }
            '}' => {
                self.pos += 1;
                Ok(Some(Token::CloseBrace))
            }
            ':' => {
                self.pos += 1;
                let word = self.take_word();
                if word.is_empty() {
                    return Err(ParseError::Malformed("empty keyword".into()));
                }
                // A word ending exactly at the buffer edge may be truncated
                if self.at_end() {
                    return Err(ParseError::Incomplete);
                }
                Ok(Some(Token::Keyword(word)))
            }
            '"' => self.take_string().map(Some),
            c if c.is_ascii_digit() || ((c == '-' || c == '+') && self.second_is_digit()) => {
                self.take_number().map(Some)
            }
            c if c.is_ascii_alphabetic() => {
                let word = self.take_word();
                if self.at_end() {
                    return Err(ParseError::Incomplete);
                }
                Ok(Some(Token::Symbol(word)))
            }
            other => Err(ParseError::Malformed(format!(
                "unexpected character {other:?}"
            ))),
        }
    }

    fn second_is_digit(&self) -> bool {
        self.rest()
            .chars()
            .nth(1)
            .map_or(false, |c| c.is_ascii_digit())
    }

    fn take_word(&mut self) -> String {
        let word: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '?'))
            .collect();
        self.pos += word.len();
        word
    }

    fn take_number(&mut self) -> Result<Token, ParseError> {
        let literal: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
            .collect();
        self.pos += literal.len();
        if self.at_end() {
            return Err(ParseError::Incomplete);
        }
        if literal.contains(['.', 'e', 'E']) {
            literal
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| ParseError::Malformed(format!("bad float literal {literal:?}")))
        } else {
            literal
                .parse::<i64>()
                .map(Token::Int)
                .map_err(|_| ParseError::Malformed(format!("bad integer literal {literal:?}")))
        }
    }

    fn take_string(&mut self) -> Result<Token, ParseError> {
        let mut chars = self.rest().char_indices().skip(1);
        let mut value = String::new();
        let mut escaped = false;
        for (offset, c) in chars.by_ref() {
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                self.pos += offset + 1;
                return Ok(Token::Str(value));
            } else {
                value.push(c);
            }
        }
        Err(ParseError::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let input = "status { :peers 2 :bpm 120.500000 :start 73743731220 :beat 597.737570 }\n";
        let (events, consumed) = decode(input);
        assert_eq!(
            events,
            vec![Event::Status {
                bpm: 120.5,
                peers: 2
            }]
        );
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_coalesced_messages() {
        let (events, _) = decode(
            "status { :bpm 120.0 :peers 0 }\nbeat-at-time { :when 73746356220 :beat 607.850980 :quantum 4.000000 }\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            Event::BeatAtTime {
                beat: 607.850_98,
                when: 73_746_356_220
            }
        );
    }

    #[test]
    fn test_whitespace_is_free() {
        let tight = decode("status{ :bpm 120.0 :peers 1 }").0;
        let airy = decode("status   {\n  :bpm   120.0\n  :peers  1\n}\n").0;
        assert_eq!(tight, airy);
        assert_eq!(
            tight,
            vec![Event::Status {
                bpm: 120.0,
                peers: 1
            }]
        );
    }

    #[test]
    fn test_partial_tail_left_unconsumed() {
        let input = "status { :bpm 120.0 :peers 1 }\nbeat-at-t";
        let (events, consumed) = decode(input);
        assert_eq!(events.len(), 1);
        assert_eq!(&input[consumed..], "beat-at-t");
    }

    #[test]
    fn test_partial_map_left_unconsumed() {
        let (events, consumed) = decode("status { :bpm 1");
        assert!(events.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_parse_version_string() {
        let (events, _) = decode("version \"1.1.0\"\n");
        assert_eq!(events, vec![Event::Version("1.1.0".to_string())]);
    }

    #[test]
    fn test_parse_unsupported_symbol() {
        let (events, _) = decode("unsupported enable-start-stop-sync\n");
        assert_eq!(
            events,
            vec![Event::Unsupported("enable-start-stop-sync".to_string())]
        );
    }

    #[test]
    fn test_unknown_message_skipped() {
        let (events, _) = decode("frobnicate { :x 1 }\nstatus { :bpm 120.0 :peers 0 }\n");
        assert_eq!(
            events,
            vec![Event::Status {
                bpm: 120.0,
                peers: 0
            }]
        );
    }

    #[test]
    fn test_phase_response() {
        let (events, _) = decode("phase-at-time { :when 999000 :phase 0.375000 }\n");
        assert_eq!(
            events,
            vec![Event::PhaseAtTime {
                phase: 0.375,
                when: 999_000
            }]
        );
    }

    #[test]
    fn test_reparse_is_field_equal() {
        // The same messages with different spacing decode identically
        let recorded = "status { :bpm 128.0 :peers 3 } phase-at-time { :when -5 :phase 0.25 }";
        let respaced = "status{:bpm 128.0 :peers 3}phase-at-time{:when -5 :phase 0.25}";
        assert_eq!(decode(recorded).0, decode(respaced).0);
        assert_eq!(decode(recorded).0.len(), 2);
    }

    #[test]
    fn test_malformed_buffer_dropped() {
        let input = "status { :bpm # }";
        let (events, consumed) = decode(input);
        assert!(events.is_empty());
        assert_eq!(consumed, input.len());
    }
}
