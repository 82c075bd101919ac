//! Transport doubles for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::crc::append_crc;
use super::transport::{Exchange, Transport};
use crate::utils::error::ModbusError;

pub type SentLog = Arc<Mutex<Vec<(Vec<u8>, Duration)>>>;

/// Replays queued replies in order; once the queue is empty it either echoes
/// the request back or stays silent.
pub struct ScriptedTransport {
    replies: VecDeque<Result<Exchange, ModbusError>>,
    echo_when_empty: bool,
    sent: SentLog,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<Exchange, ModbusError>>) -> Self {
        Self {
            replies: replies.into(),
            echo_when_empty: false,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    pub fn echo() -> Self {
        let mut transport = Self::silent();
        transport.echo_when_empty = true;
        transport
    }

    pub fn sent(&self) -> SentLog {
        Arc::clone(&self.sent)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Exchange, ModbusError> {
        self.sent.lock().unwrap().push((request.to_vec(), timeout));
        match self.replies.pop_front() {
            Some(reply) => reply,
            None if self.echo_when_empty => Ok(Exchange::received(request.to_vec())),
            None => Ok(Exchange::timeout()),
        }
    }
}

/// A reply frame with a valid CRC appended.
pub fn reply(mut frame: Vec<u8>) -> Result<Exchange, ModbusError> {
    append_crc(&mut frame);
    Ok(Exchange::received(frame))
}

/// Register read reply for `registers` from `slave`.
pub fn registers_reply(slave: u8, function: u8, registers: &[u16]) -> Result<Exchange, ModbusError> {
    let mut frame = vec![slave, function, (registers.len() * 2) as u8];
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    reply(frame)
}
