//! Content-type detection from the leading bytes of a stream.
//!
//! Detection never needs the whole object: [`sniff_stream`] reads at most
//! [`SNIFF_LEN`] bytes (rounded up to the chunk that crosses the boundary),
//! classifies them, and hands back a stream that replays the consumed chunks
//! before continuing with the untouched remainder.

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{ByteStream, StorageError, StorageResult};

/// Number of leading bytes considered for classification
pub const SNIFF_LEN: usize = 512;

/// Fallback for content that matches no rule
pub const OCTET_STREAM: &str = "application/octet-stream";

pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

/// Outcome of sniffing a stream
pub struct Sniffed {
    /// `None` only when the stream was empty
    pub content_type: Option<&'static str>,
    /// The original byte sequence, in full
    pub stream: ByteStream,
}

/// Read the front of `stream`, classify it, and rebuild the full stream.
///
/// A stream shorter than [`SNIFF_LEN`] is classified on what it has. Any read
/// error while filling the window fails with [`StorageError::SniffRead`],
/// because the bytes already consumed cannot be handed back.
pub async fn sniff_stream(mut stream: ByteStream) -> StorageResult<Sniffed> {
    let mut consumed = VecDeque::new();
    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut exhausted = false;

    while head.len() < SNIFF_LEN {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(SNIFF_LEN - head.len());
                head.extend_from_slice(&chunk[..take]);
                consumed.push_back(chunk);
            }
            Some(Err(source)) => return Err(StorageError::SniffRead { source }),
            None => {
                exhausted = true;
                break;
            }
        }
    }

    let content_type = (!head.is_empty()).then(|| detect_content_type(&head));
    let rest = (!exhausted).then_some(stream);

    Ok(Sniffed {
        content_type,
        stream: Box::pin(SniffedStream {
            prefix: consumed,
            rest,
        }),
    })
}

/// Buffered prefix followed by the remainder of the source stream
pub struct SniffedStream {
    prefix: VecDeque<Bytes>,
    rest: Option<ByteStream>,
}

impl Stream for SniffedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(chunk) = self.prefix.pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }

        let Some(rest) = self.rest.as_mut() else {
            return Poll::Ready(None);
        };
        match rest.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                // never poll a finished stream again
                self.rest = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let buffered = self.prefix.len();
        match &self.rest {
            Some(rest) => {
                let (low, high) = rest.size_hint();
                (low.saturating_add(buffered), high.and_then(|h| h.checked_add(buffered)))
            }
            None => (buffered, Some(buffered)),
        }
    }
}

/// Classify `data` into a media type. Only the first [`SNIFF_LEN`] bytes are
/// looked at; the result is never empty.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];
    let first_non_ws = data
        .iter()
        .position(|b| !is_whitespace(*b))
        .unwrap_or(data.len());
    let trimmed = &data[first_non_ws..];

    if HTML_TAGS.iter().any(|tag| matches_html_tag(trimmed, tag)) {
        return "text/html; charset=utf-8";
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    for signature in SIGNATURES {
        if signature.matches(data) {
            return signature.mime;
        }
    }

    if is_mp4(data) {
        return "video/mp4";
    }
    // embedded OpenType carries its magic at offset 34
    if data.get(34..36) == Some(b"LP".as_slice()) {
        return "application/vnd.ms-fontobject";
    }
    if !data.iter().any(|b| is_binary(*b)) {
        return TEXT_PLAIN_UTF8;
    }
    OCTET_STREAM
}

/// Magic bytes compared under a mask; `None` mask means an exact prefix
struct Signature {
    pattern: &'static [u8],
    mask: Option<&'static [u8]>,
    mime: &'static str,
}

impl Signature {
    const fn exact(pattern: &'static [u8], mime: &'static str) -> Self {
        Self { pattern, mask: None, mime }
    }

    const fn masked(pattern: &'static [u8], mask: &'static [u8], mime: &'static str) -> Self {
        Self { pattern, mask: Some(mask), mime }
    }

    fn matches(&self, data: &[u8]) -> bool {
        if data.len() < self.pattern.len() {
            return false;
        }
        match self.mask {
            None => data.starts_with(self.pattern),
            Some(mask) => self
                .pattern
                .iter()
                .zip(mask)
                .zip(data)
                .all(|((p, m), d)| d & m == *p),
        }
    }
}

const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

const SIGNATURES: &[Signature] = &[
    Signature::exact(b"%PDF-", "application/pdf"),
    Signature::exact(b"%!PS-Adobe-", "application/postscript"),
    // byte order marks
    Signature::masked(b"\xFE\xFF\x00\x00", b"\xFF\xFF\x00\x00", "text/plain; charset=utf-16be"),
    Signature::masked(b"\xFF\xFE\x00\x00", b"\xFF\xFF\x00\x00", "text/plain; charset=utf-16le"),
    Signature::masked(b"\xEF\xBB\xBF\x00", b"\xFF\xFF\xFF\x00", TEXT_PLAIN_UTF8),
    // images
    Signature::exact(b"\x00\x00\x01\x00", "image/x-icon"),
    Signature::exact(b"\x00\x00\x02\x00", "image/x-icon"),
    Signature::exact(b"BM", "image/bmp"),
    Signature::exact(b"GIF87a", "image/gif"),
    Signature::exact(b"GIF89a", "image/gif"),
    Signature::masked(
        b"RIFF\x00\x00\x00\x00WEBPVP",
        b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        "image/webp",
    ),
    Signature::exact(b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    Signature::exact(b"\xFF\xD8\xFF", "image/jpeg"),
    // audio and video
    Signature::exact(b".snd", "audio/basic"),
    Signature::masked(
        b"FORM\x00\x00\x00\x00AIFF",
        b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        "audio/aiff",
    ),
    Signature::exact(b"ID3", "audio/mpeg"),
    Signature::exact(b"OggS\x00", "application/ogg"),
    Signature::exact(b"MThd\x00\x00\x00\x06", "audio/midi"),
    Signature::masked(
        b"RIFF\x00\x00\x00\x00AVI ",
        b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        "video/avi",
    ),
    Signature::masked(
        b"RIFF\x00\x00\x00\x00WAVE",
        b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        "audio/wave",
    ),
    Signature::exact(b"\x1A\x45\xDF\xA3", "video/webm"),
    // fonts
    Signature::exact(b"\x00\x01\x00\x00", "font/ttf"),
    Signature::exact(b"OTTO", "font/otf"),
    Signature::exact(b"ttcf", "font/collection"),
    Signature::exact(b"wOFF", "font/woff"),
    Signature::exact(b"wOF2", "font/woff2"),
    // archives
    Signature::exact(b"\x1F\x8B\x08", "application/x-gzip"),
    Signature::exact(b"PK\x03\x04", "application/zip"),
    Signature::exact(b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    Signature::exact(b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    Signature::exact(b"\x00\x61\x73\x6D", "application/wasm"),
];

/// Case-insensitive tag prefix that must be followed by a space or `>`
fn matches_html_tag(data: &[u8], tag: &[u8]) -> bool {
    if data.len() < tag.len() + 1 {
        return false;
    }
    let name_matches = tag.iter().zip(data).all(|(t, d)| d.to_ascii_uppercase() == *t);
    name_matches && matches!(data[tag.len()], b' ' | b'>')
}

/// ISO base media file with an `mp4` major or compatible brand
fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size % 4 != 0 || data.len() < box_size || &data[4..8] != b"ftyp" {
        return false;
    }
    (8..box_size)
        .step_by(4)
        .filter(|&start| start != 12) // minor version
        .any(|start| data.get(start..start + 3) == Some(b"mp4".as_slice()))
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | 0x0C | b'\r' | b' ')
}

/// Control bytes that never appear in text
fn is_binary(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
