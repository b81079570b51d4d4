//! Fixed-capacity radio packet frames and their published form.

use core::ffi::CStr;
use core::fmt::Write;

use serde::Serialize;

use crate::error::{GatewayError, Result};

/// Largest packet the radio is configured to deliver.
pub const MAX_PACKET_LEN: usize = 32;

/// Frame capacity: the packet plus one terminator byte.
pub const FRAME_CAPACITY: usize = MAX_PACKET_LEN + 1;

/// Receive buffer that always keeps room for a NUL terminator.
///
/// The radio writes into [`PacketFrame::writable`], which is one byte short of
/// the capacity. [`PacketFrame::commit`] then checks the length the radio
/// reported before terminating, so a misbehaving driver can never make the
/// terminator land outside the buffer.
#[derive(Debug, Clone)]
pub struct PacketFrame<const N: usize = FRAME_CAPACITY> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> Default for PacketFrame<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PacketFrame<N> {
    pub const CAPACITY: usize = N;

    pub const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    /// Area the radio may fill.
    pub fn writable(&mut self) -> &mut [u8] {
        let max = N.saturating_sub(1);
        &mut self.buf[..max]
    }

    /// Accepts `len` bytes written by the radio and terminates them.
    pub fn commit(&mut self, len: usize) -> Result<&[u8]> {
        if len >= N {
            self.len = 0;
            return Err(GatewayError::RadioReadOverrun { len, capacity: N });
        }
        self.buf[len] = 0;
        self.len = len;
        Ok(&self.buf[..len])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload up to the first NUL, terminator included.
    pub fn as_c_str(&self) -> Option<&CStr> {
        CStr::from_bytes_until_nul(&self.buf[..=self.len]).ok()
    }

    /// Text view of the payload.
    ///
    /// Only printable UTF-8 counts as text, optionally followed by a single
    /// trailing NUL (`plop\0`). A NUL anywhere else or a control byte means
    /// the payload is binary, so no byte is hidden behind the terminator and
    /// the rendered report stays within [`REPORT_CAPACITY`].
    pub fn as_text(&self) -> Option<&str> {
        let text = self.as_c_str()?.to_bytes();
        if text.len() + 1 < self.len {
            return None;
        }
        let text = core::str::from_utf8(text).ok()?;
        if text.chars().any(char::is_control) {
            return None;
        }
        Some(text)
    }
}

/// Upper bound of a rendered packet report.
///
/// The largest field is either the hex dump or text made only of characters
/// JSON escapes with two bytes, both `2 * MAX_PACKET_LEN`.
pub const REPORT_CAPACITY: usize = 160;

/// `{"text":"","len":32,"rssi":-32768,"snr":}` plus room for any `f32`.
const REPORT_OVERHEAD: usize = 48 + 24;

const _: () = assert!(2 * MAX_PACKET_LEN + REPORT_OVERHEAD <= REPORT_CAPACITY);

/// A received packet and its link quality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioPacket<'a> {
    pub payload: &'a [u8],
    pub text: Option<&'a str>,
    pub rssi: i16,
    pub snr: f32,
}

#[derive(Serialize)]
struct PacketReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hex: Option<&'a str>,
    len: usize,
    rssi: i16,
    snr: f32,
}

impl<'a> RadioPacket<'a> {
    pub fn new<const N: usize>(frame: &'a PacketFrame<N>, rssi: i16, snr: f32) -> Self {
        Self {
            payload: frame.payload(),
            text: frame.as_text(),
            rssi,
            snr,
        }
    }

    /// Renders the publish payload, e.g.
    /// `{"text":"hello","len":5,"rssi":-42,"snr":9.5}`.
    ///
    /// Payloads that are not text are sent as a `hex` field instead.
    pub fn render(&self, out: &mut [u8]) -> Result<usize> {
        let mut hex = heapless::String::<{ 2 * MAX_PACKET_LEN }>::new();
        let hex = match self.text {
            Some(_) => None,
            None => {
                for byte in self.payload {
                    write!(hex, "{:02x}", byte).map_err(|_| GatewayError::PayloadTooLarge {
                        len: self.payload.len() * 2,
                        capacity: hex.capacity(),
                    })?;
                }
                Some(hex.as_str())
            }
        };
        let report = PacketReport {
            text: self.text,
            hex,
            len: self.payload.len(),
            rssi: self.rssi,
            snr: self.snr,
        };
        serde_json_core::to_slice(&report, out).map_err(|_| GatewayError::PayloadTooLarge {
            len: self.payload.len(),
            capacity: out.len(),
        })
    }
}
