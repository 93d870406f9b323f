//! Event sources.
//!
//! A source hands decoded payloads to a handler one at a time and waits for
//! the handler to return before reading the next one. Nothing is queued.

use std::io::BufRead;
use std::thread;
use std::time::Duration;

use crate::config::PubSubConfig;
use crate::error::{OccResult, SourceError};
use crate::payload::Payload;

/// Delay between reconnection attempts to the pubsub service.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Delivers payloads to a handler.
pub trait EventSource {
    /// Feed payloads to `handler` until the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails in a way it cannot recover from.
    fn run(&mut self, handler: &mut dyn FnMut(Payload)) -> OccResult<()>;
}

/// Decode one line of a newline-delimited JSON stream.
///
/// Blank lines yield `None`.
///
/// # Errors
///
/// Returns `SourceError::Decode` for a line that is not a valid payload,
/// including one that is not valid UTF-8.
pub fn decode_line(line: &[u8]) -> Result<Option<Payload>, SourceError> {
    let Some(start) = line.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Ok(None);
    };
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(line.len(), |i| i + 1);
    Payload::from_slice(&line[start..end]).map(Some)
}

/// Feed every payload in `reader` to `handler`, skipping undecodable lines.
///
/// Returns the number of payloads delivered. Only I/O failures end the pump.
fn pump<R: BufRead>(mut reader: R, handler: &mut dyn FnMut(Payload)) -> Result<usize, SourceError> {
    let mut delivered = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).map_err(SourceError::Read)? == 0 {
            return Ok(delivered);
        }
        match decode_line(&line) {
            Ok(Some(payload)) => {
                handler(payload);
                delivered += 1;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "skipping undecodable payload"),
        }
    }
}

/// Newline-delimited JSON payloads from any reader, e.g. stdin.
pub struct LineSource<R> {
    reader: R,
}

impl<R: BufRead> LineSource<R> {
    /// Source reading from `reader` until end of input.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> EventSource for LineSource<R> {
    fn run(&mut self, handler: &mut dyn FnMut(Payload)) -> OccResult<()> {
        let delivered = pump(&mut self.reader, handler)?;
        tracing::info!(delivered, "input exhausted");
        Ok(())
    }
}

/// Streaming client for a pubsub service.
///
/// The service answers a GET with a never-ending body of newline-delimited
/// JSON events. Dropped connections and transient failures are retried
/// every [`RECONNECT_DELAY`]. A response the server will keep giving, such
/// as a rejected credential, ends `run` with an error.
pub struct PubSubListener {
    cfg: PubSubConfig,
    client: reqwest::blocking::Client,
}

impl PubSubListener {
    /// Build a listener for `cfg`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::ConnectionFailed` if the HTTP client cannot be built.
    pub fn new(cfg: PubSubConfig) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            // The stream is open-ended; only the connect phase is bounded.
            .timeout(None)
            .user_agent(concat!("occ/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::ConnectionFailed {
                url: cfg.url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { cfg, client })
    }

    fn connect(&self) -> Result<reqwest::blocking::Response, SourceError> {
        let mut req = self.client.get(&self.cfg.url);
        if let Some(user) = &self.cfg.user {
            req = req.basic_auth(user, self.cfg.pass.as_ref());
        }
        let resp = req.send().map_err(|e| SourceError::ConnectionFailed {
            url: self.cfg.url.clone(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }

    /// Connect once and pump events until the stream ends or fails.
    fn listen_once(&self, handler: &mut dyn FnMut(Payload)) -> Result<usize, SourceError> {
        let resp = self.connect()?;
        tracing::info!(url = %self.cfg.url, "connected, listening for events");
        pump(std::io::BufReader::new(resp), handler)
    }
}

impl EventSource for PubSubListener {
    fn run(&mut self, handler: &mut dyn FnMut(Payload)) -> OccResult<()> {
        loop {
            tracing::info!(url = %self.cfg.url, "connecting to pubsub");
            match self.listen_once(handler) {
                Ok(delivered) => tracing::warn!(delivered, "pubsub stream ended"),
                Err(e) if e.is_retryable() => tracing::warn!(error = %e, "pubsub connection failed"),
                Err(e) => return Err(e.into()),
            }
            thread::sleep(RECONNECT_DELAY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OccError;
    use std::io::{Cursor, Read, Write};
    use std::net::TcpListener;

    #[test]
    fn line_source_delivers_in_order_and_skips_garbage() {
        let input = concat!(
            "{\"pubsub_topics\":[\"svn\"]}\n",
            "\n",
            "not json\n",
            "{\"stillalive\":1}\n",
            "{\"pubsub_topics\":[\"git\"]}\n",
        );
        let mut source = LineSource::new(Cursor::new(input));
        let mut seen = Vec::new();
        source
            .run(&mut |p: Payload| {
                seen.push(if p.heartbeat {
                    "ping".to_string()
                } else {
                    p.topics.iter().cloned().collect::<Vec<_>>().join(",")
                });
            })
            .unwrap();
        assert_eq!(seen, vec!["svn", "ping", "git"]);
    }

    #[test]
    fn decode_line_ignores_whitespace() {
        assert!(decode_line(b"   \n").unwrap().is_none());
        assert!(decode_line(b" {\"pubsub_topics\":[]} \r\n").unwrap().is_some());
        assert!(decode_line(b"[1,2").is_err());
    }

    #[test]
    fn invalid_utf8_line_is_skipped() {
        let mut input = b"{\"pubsub_topics\":[\"svn\"]}\n".to_vec();
        input.extend_from_slice(b"{\"pubsub_topics\":[\"\xff\xfe\"]}\n");
        input.extend_from_slice(b"{\"pubsub_topics\":[\"git\"]}\n");

        let mut source = LineSource::new(Cursor::new(input));
        let mut seen = Vec::new();
        source
            .run(&mut |p: Payload| seen.extend(p.topics.iter().cloned()))
            .unwrap();
        assert_eq!(seen, vec!["svn", "git"]);
    }

    #[test]
    fn last_line_without_newline_is_delivered() {
        let mut source = LineSource::new(Cursor::new("{\"pubsub_topics\":[\"svn\"]}"));
        let mut count = 0;
        source.run(&mut |_: Payload| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/")
    }

    #[test]
    fn rejected_credentials_stop_the_listener() {
        let url = serve_once("HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let mut listener = PubSubListener::new(PubSubConfig {
            url,
            user: Some("occ".to_string()),
            pass: Some("wrong".to_string()),
        })
        .unwrap();

        let err = listener.run(&mut |_: Payload| {}).unwrap_err();
        assert!(
            matches!(err, OccError::Source(SourceError::HttpStatus { status: 401 })),
            "{err:?}"
        );
    }

    #[test]
    fn listener_builds_with_valid_config() {
        let listener = PubSubListener::new(PubSubConfig {
            url: "http://127.0.0.1:9/".to_string(),
            user: Some("occ".to_string()),
            pass: Some("secret".to_string()),
        });
        assert!(listener.is_ok());
    }
}
