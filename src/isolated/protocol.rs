//! Host/worker messages and their framing.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. The host only sends a `Run` after the previous `Done`, so a worker
//! never has more than one task in flight.

use crate::error::{Error, Result, TaskError};
use crate::executor::task::TaskId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufReader, BufWriter, Read, Write};

/// Largest frame either side will send or accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Call `name` once per payload, in order, stopping at the first failure.
    Run {
        id: TaskId,
        name: String,
        payloads: Vec<Value>,
    },
    /// Interrupt the task `id` if it is the one running.
    Cancel { id: TaskId },
    /// Exit after the current task.
    Shutdown,
}

/// Worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// First frame of every worker.
    Ready { pid: u32 },
    Done { id: TaskId, outcome: Outcome },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Vec<Value>),
    Err(TaskError),
}

impl Outcome {
    pub fn into_result(self) -> Result<Vec<Value>> {
        match self {
            Outcome::Ok(values) => Ok(values),
            Outcome::Err(e) => Err(Error::Task(e)),
        }
    }
}

/// Fail with [`Error::Serialization`] unless the `Run` frame for these
/// payloads fits in [`MAX_FRAME_LEN`]. Nothing is buffered.
pub fn check_run_frame(id: TaskId, name: &str, payloads: &[Value]) -> Result<()> {
    check_len(run_frame_len(id, name, payloads)?)
}

fn run_frame_len(id: TaskId, name: &str, payloads: &[Value]) -> Result<usize> {
    // same bytes as `Request::Run`, without taking ownership of the payloads
    #[derive(Serialize)]
    struct RunFrame<'a> {
        #[serde(rename = "type")]
        kind: &'static str,
        id: TaskId,
        name: &'a str,
        payloads: &'a [Value],
    }

    let mut counter = ByteCount(0);
    serde_json::to_writer(
        &mut counter,
        &RunFrame {
            kind: "run",
            id,
            name,
            payloads,
        },
    )?;
    Ok(counter.0)
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(())
}

struct ByteCount(usize);

impl Write for ByteCount {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct FrameWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    /// Write one frame. A message that cannot be encoded, or is too large,
    /// fails with [`Error::Serialization`] before any byte is written.
    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        check_len(body.len())?;
        self.inner.write_all(&(body.len() as u32).to_be_bytes())?;
        self.inner.write_all(&body)?;
        self.inner.flush()?;
        Ok(())
    }
}

pub struct FrameReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read one frame. A peer that went away yields [`Error::ChannelClosed`].
    pub fn recv<M: DeserializeOwned>(&mut self) -> Result<M> {
        let mut header = [0u8; 4];
        self.inner.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Serialization(format!(
                "peer announced a {} byte frame (limit {})",
                len, MAX_FRAME_LEN
            )));
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_frames_back_to_back() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer
                .send(&Request::Run {
                    id: TaskId::next(),
                    name: "echo".into(),
                    payloads: vec![json!({"a": 1}), json!(null)],
                })
                .unwrap();
            writer.send(&Request::Shutdown).unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buf));
        match reader.recv::<Request>().unwrap() {
            Request::Run { name, payloads, .. } => {
                assert_eq!(name, "echo");
                assert_eq!(payloads.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reader.recv::<Request>().unwrap(), Request::Shutdown);
        assert!(matches!(reader.recv::<Request>(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_truncated_frame_is_closed_channel() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{\"ty");
        let mut reader = FrameReader::new(Cursor::new(buf));
        assert!(matches!(reader.recv::<Request>(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let buf = (MAX_FRAME_LEN as u32 + 1).to_be_bytes().to_vec();
        let mut reader = FrameReader::new(Cursor::new(buf));
        assert!(matches!(reader.recv::<Request>(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_run_frame_length_is_exact() {
        let id = TaskId::next();
        let payloads = vec![json!({"k": [1, 2, 3]}), json!("text")];
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf)
            .send(&Request::Run {
                id,
                name: "echo".into(),
                payloads: payloads.clone(),
            })
            .unwrap();

        assert_eq!(buf.len(), 4 + run_frame_len(id, "echo", &payloads).unwrap());
        check_run_frame(id, "echo", &payloads).unwrap();
    }

    #[test]
    fn test_oversized_message_writes_nothing() {
        let big = json!("x".repeat(MAX_FRAME_LEN));
        let id = TaskId::next();
        assert!(matches!(
            check_run_frame(id, "echo", std::slice::from_ref(&big)),
            Err(Error::Serialization(_))
        ));

        let mut buf = Vec::new();
        let sent = FrameWriter::new(&mut buf).send(&Request::Run {
            id,
            name: "echo".into(),
            payloads: vec![big],
        });
        assert!(matches!(sent, Err(Error::Serialization(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wire_shape() {
        let done = Response::Done {
            id: TaskId::next(),
            outcome: Outcome::Err(TaskError::new("ValueError", "bad")),
        };
        let v = serde_json::to_value(&done).unwrap();
        assert_eq!(v["type"], "done");
        assert_eq!(v["outcome"]["err"]["kind"], "ValueError");
    }
}
