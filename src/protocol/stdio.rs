//! JSON-lines transport: one message per line on stdin, one per line on stdout.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde_json::Value;

use super::{Envelope, OutboundMessage, Port, Publisher};

/// Reader and writer threads bridging a line-oriented stream pair to the protocol handler.
pub struct StdioBridge {
    outbox: Sender<OutboundMessage>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl StdioBridge {
    /// Bridges the process's stdin and stdout. `wake` runs after each queued message.
    pub fn spawn(inbox: Sender<Envelope>, wake: impl Fn() + Send + 'static) -> Result<Self> {
        Self::spawn_with(io::BufReader::new(io::stdin()), io::stdout(), inbox, wake)
    }

    pub fn spawn_with<R, W>(input: R, output: W, inbox: Sender<Envelope>, wake: impl Fn() + Send + 'static) -> Result<Self>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let (outbox, outgoing) = mpsc::channel::<OutboundMessage>();
        let writer = thread::Builder::new()
            .name("protocol-writer".to_string())
            .spawn(move || {
                let mut output = output;
                for message in outgoing {
                    if let Err(err) = write_line(&mut output, &message) {
                        log::warn!("[stdio] write failed: {err:#}");
                        break;
                    }
                }
            })
            .context("Failed to spawn protocol writer thread")?;

        let port = Port::new(outbox.clone());
        let reader = thread::Builder::new()
            .name("protocol-reader".to_string())
            .spawn(move || {
                for line in input.lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => {
                            log::warn!("[stdio] read failed: {err}");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let payload: Value = match serde_json::from_str(&line) {
                        Ok(payload) => payload,
                        Err(err) => {
                            log::warn!("[stdio] ignoring malformed line: {err}");
                            continue;
                        }
                    };
                    if inbox.send(Envelope { origin: port.clone(), payload }).is_err() {
                        break;
                    }
                    wake();
                }
                log::debug!("[stdio] input closed");
            })
            .context("Failed to spawn protocol reader thread")?;

        Ok(Self { outbox, reader: Some(reader), writer: Some(writer) })
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.outbox.clone())
    }

    /// Waits for the input stream to end.
    pub fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("[stdio] reader thread panicked");
            }
        }
    }

    /// Flushes pending output and stops the writer. Ports and publishers cloned earlier must be
    /// dropped first or this waits for them.
    pub fn shutdown(mut self) {
        self.join_reader();
        drop(self.outbox);
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::warn!("[stdio] writer thread panicked");
            }
        }
    }
}

fn write_line(output: &mut impl Write, message: &OutboundMessage) -> Result<()> {
    serde_json::to_writer(&mut *output, message).context("Failed to encode message")?;
    output.write_all(b"\n").context("Failed to write message")?;
    output.flush().context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buffer lock").write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lines_become_envelopes_and_replies_become_lines() {
        let input = Cursor::new(b"{\"type\":\"GET_JOINTS\",\"requestId\":\"a\"}\nnot json\n\n{\"type\":\"RESET_SCENE\"}\n".to_vec());
        let output = SharedBuffer::default();
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let mut bridge = StdioBridge::spawn_with(input, output.clone(), inbox_tx, || {}).expect("spawn bridge");
        bridge.join_reader();

        let envelopes: Vec<Envelope> = inbox_rx.try_iter().collect();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].payload["requestId"], "a");

        envelopes[0].origin.post(OutboundMessage::new(MessageType::ResetSceneResponse, json!({"success": true}), Some(json!("a"))));
        bridge.publisher().publish(MessageType::RobotLoaded, json!({"robotId": "r1"}));
        drop(envelopes);
        bridge.shutdown();

        let written = String::from_utf8(output.0.lock().expect("buffer lock").clone()).expect("utf8");
        let lines: Vec<Value> = written.lines().map(|line| serde_json::from_str(line).expect("json line")).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["requestId"], "a");
        assert_eq!(lines[1]["type"], "ROBOT_LOADED");
        assert!(lines[1].get("requestId").is_none());
    }
}
