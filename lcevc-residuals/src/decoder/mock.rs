/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! A scriptable decoder for tests and offline replay.

use std::collections::HashMap;

use super::{DecoderBackend, ErrorCode, PictureInfo, PixelBuffer};
use crate::packet::Level;

/// A call observed by the mock, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    Open(u32),
    Close(u32),
    ClearTemporal { session: u32, level: Level },
    Parse { session: u32, payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    code: ErrorCode,
    /// What `last_error` reports afterwards, when it differs from `code`.
    status: Option<ErrorCode>,
    remaining: Option<u32>,
}

/// Session state of a [`MockDecoder`].
#[derive(Debug)]
pub struct MockHandle {
    session: u32,
    picture: Option<PictureInfo>,
    last_error: Option<ErrorCode>,
}

impl MockHandle {
    pub fn session(&self) -> u32 {
        self.session
    }
}

/// Decoder that accepts any payload unless told otherwise and records every
/// call it receives.
#[derive(Debug)]
pub struct MockDecoder {
    width: u32,
    height: u32,
    failures: HashMap<Vec<u8>, Failure>,
    zero_sized: Vec<Vec<u8>>,
    open_failure: Option<ErrorCode>,
    sessions: u32,
    events: Vec<DecoderEvent>,
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDecoder {
    pub fn new() -> Self {
        Self {
            width: 1920,
            height: 1080,
            failures: HashMap::new(),
            zero_sized: Vec::new(),
            open_failure: None,
            sessions: 0,
            events: Vec::new(),
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Every parse of `payload` fails with `code`.
    pub fn fail_on(&mut self, payload: impl Into<Vec<u8>>, code: ErrorCode) {
        self.failures.insert(
            payload.into(),
            Failure {
                code,
                status: None,
                remaining: None,
            },
        );
    }

    /// Every parse of `payload` returns `code` while the session status
    /// reports the more specific `status`.
    pub fn fail_with_status(
        &mut self,
        payload: impl Into<Vec<u8>>,
        code: ErrorCode,
        status: ErrorCode,
    ) {
        self.failures.insert(
            payload.into(),
            Failure {
                code,
                status: Some(status),
                remaining: None,
            },
        );
    }

    /// The next parse of `payload` fails with `code`, later ones succeed.
    pub fn fail_once(&mut self, payload: impl Into<Vec<u8>>, code: ErrorCode) {
        self.failures.insert(
            payload.into(),
            Failure {
                code,
                status: None,
                remaining: Some(1),
            },
        );
    }

    /// Parsing `payload` succeeds but reports a zero-sized picture.
    pub fn zero_dimensions_on(&mut self, payload: impl Into<Vec<u8>>) {
        self.zero_sized.push(payload.into());
    }

    pub fn fail_open(&mut self, code: Option<ErrorCode>) {
        self.open_failure = code;
    }

    pub fn events(&self) -> &[DecoderEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Payloads parsed so far, in order.
    pub fn fed_payloads(&self) -> Vec<&[u8]> {
        self.events
            .iter()
            .filter_map(|event| match event {
                DecoderEvent::Parse { payload, .. } => Some(payload.as_slice()),
                _ => None,
            })
            .collect()
    }

    /// Number of sessions ever opened.
    pub fn sessions_opened(&self) -> u32 {
        self.sessions
    }

    fn take_failure(&mut self, payload: &[u8]) -> Option<Failure> {
        let failure = self.failures.get_mut(payload)?;
        match failure.remaining {
            Some(0) => None,
            Some(remaining) => {
                failure.remaining = Some(remaining - 1);
                Some(*failure)
            }
            None => Some(*failure),
        }
    }
}

impl DecoderBackend for MockDecoder {
    type Handle = MockHandle;

    fn open(&mut self) -> Result<MockHandle, ErrorCode> {
        if let Some(code) = self.open_failure {
            return Err(code);
        }
        self.sessions += 1;
        log::debug!("[MOCK_DECODER] open session {}", self.sessions);
        self.events.push(DecoderEvent::Open(self.sessions));
        Ok(MockHandle {
            session: self.sessions,
            picture: None,
            last_error: None,
        })
    }

    fn close(&mut self, handle: MockHandle) {
        log::debug!("[MOCK_DECODER] close session {}", handle.session);
        self.events.push(DecoderEvent::Close(handle.session));
    }

    fn clear_temporal_state(&mut self, handle: &mut MockHandle, level: Level) {
        handle.picture = None;
        self.events.push(DecoderEvent::ClearTemporal {
            session: handle.session,
            level,
        });
    }

    fn parse(&mut self, handle: &mut MockHandle, payload: &[u8]) -> Result<PictureInfo, ErrorCode> {
        self.events.push(DecoderEvent::Parse {
            session: handle.session,
            payload: payload.to_vec(),
        });

        if let Some(Failure { code, status, .. }) = self.take_failure(payload) {
            log::debug!("[MOCK_DECODER] failing {} byte payload: {code}", payload.len());
            handle.picture = None;
            handle.last_error = Some(status.unwrap_or(code));
            return Err(code);
        }

        let zero = self.zero_sized.iter().any(|p| p.as_slice() == payload);
        let picture = PictureInfo {
            width: if zero { 0 } else { self.width },
            height: if zero { 0 } else { self.height },
            is_1d: false,
            has_base: true,
            has_high: true,
        };
        handle.picture = Some(picture);
        handle.last_error = None;
        Ok(picture)
    }

    fn decode_base(&mut self, handle: &mut MockHandle) -> Result<PixelBuffer, ErrorCode> {
        // Base residuals are at half resolution.
        let picture = handle.picture.ok_or(ErrorCode::GenericStream)?;
        Ok(PixelBuffer {
            width: picture.width / 2,
            height: picture.height / 2,
            data: Vec::new(),
        })
    }

    fn decode_high(&mut self, handle: &mut MockHandle) -> Result<PixelBuffer, ErrorCode> {
        let picture = handle.picture.ok_or(ErrorCode::GenericStream)?;
        Ok(PixelBuffer {
            width: picture.width,
            height: picture.height,
            data: Vec::new(),
        })
    }

    fn last_error(&self, handle: &MockHandle) -> Option<ErrorCode> {
        handle.last_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_in_order() {
        let mut decoder = MockDecoder::new().with_dimensions(64, 32);
        let mut handle = decoder.open().unwrap();
        decoder.clear_temporal_state(&mut handle, Level::Rendition(1));
        let picture = decoder.parse(&mut handle, b"abc").unwrap();
        assert_eq!((picture.width, picture.height), (64, 32));
        assert_eq!(decoder.decode_base(&mut handle).unwrap().width, 32);
        decoder.close(handle);

        assert_eq!(
            decoder.events(),
            &[
                DecoderEvent::Open(1),
                DecoderEvent::ClearTemporal {
                    session: 1,
                    level: Level::Rendition(1)
                },
                DecoderEvent::Parse {
                    session: 1,
                    payload: b"abc".to_vec()
                },
                DecoderEvent::Close(1),
            ]
        );
    }

    #[test]
    fn scripted_failures() {
        let mut decoder = MockDecoder::new();
        decoder.fail_on(b"bad".to_vec(), ErrorCode::Other(9));
        decoder.fail_once(b"flaky".to_vec(), ErrorCode::GenericStream);
        let mut handle = decoder.open().unwrap();

        assert_eq!(decoder.parse(&mut handle, b"bad"), Err(ErrorCode::Other(9)));
        assert_eq!(decoder.last_error(&handle), Some(ErrorCode::Other(9)));
        assert_eq!(decoder.parse(&mut handle, b"bad"), Err(ErrorCode::Other(9)));
        assert_eq!(
            decoder.parse(&mut handle, b"flaky"),
            Err(ErrorCode::GenericStream)
        );
        assert!(decoder.parse(&mut handle, b"flaky").is_ok());
        assert_eq!(decoder.last_error(&handle), None);
        assert_eq!(decoder.fed_payloads().len(), 4);
    }

    #[test]
    fn status_can_differ_from_returned_code() {
        let mut decoder = MockDecoder::new();
        decoder.fail_with_status(b"odd".to_vec(), ErrorCode::Other(1), ErrorCode::GenericStream);
        let mut handle = decoder.open().unwrap();

        assert_eq!(decoder.parse(&mut handle, b"odd"), Err(ErrorCode::Other(1)));
        assert_eq!(decoder.last_error(&handle), Some(ErrorCode::GenericStream));
    }

    #[test]
    fn decode_without_picture_fails() {
        let mut decoder = MockDecoder::new();
        let mut handle = decoder.open().unwrap();
        assert!(decoder.decode_high(&mut handle).is_err());
        decoder.zero_dimensions_on(b"z".to_vec());
        let picture = decoder.parse(&mut handle, b"z").unwrap();
        assert_eq!(picture.width, 0);
    }
}
