//! Content-Encoding decoders.
//!
//! Responses are decoded when collected, not while streaming. Built-in
//! decoders cover `gzip`, `deflate`, and `br`; custom decoders registered
//! through [`Config::decoders`][crate::Config] take precedence and are
//! advertised first in `accept-encoding`. Unknown encodings pass through
//! untouched.

use std::fmt;
use std::io::Read;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Decodes a single `content-encoding` token.
///
/// Implementations must be stateless across calls: `decode` receives the
/// complete encoded payload and returns the complete decoded payload.
pub trait ContentDecoder: Send + Sync {
    /// The encoding token this decoder handles, as it appears in
    /// `content-encoding` and `accept-encoding` (for example `"zstd"`).
    fn name(&self) -> &str;

    /// Decode the full payload.
    fn decode(&self, data: &[u8]) -> Result<Bytes>;
}

impl fmt::Debug for dyn ContentDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentDecoder").field(&self.name()).finish()
    }
}

/// Built-in gzip decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipDecoder;

impl ContentDecoder for GzipDecoder {
    fn name(&self) -> &str {
        "gzip"
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut decoded)
            .map_err(|err| Error::decode("gzip", err))?;
        Ok(Bytes::from(decoded))
    }
}

/// Built-in deflate decoder.
///
/// Tries zlib-wrapped deflate first, then raw deflate. Servers disagree on
/// which one `content-encoding: deflate` means.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeflateDecoder;

impl ContentDecoder for DeflateDecoder {
    fn name(&self) -> &str {
        "deflate"
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        let mut decoded = Vec::new();
        if flate2::read::ZlibDecoder::new(data)
            .read_to_end(&mut decoded)
            .is_ok()
        {
            return Ok(Bytes::from(decoded));
        }
        decoded.clear();
        flate2::read::DeflateDecoder::new(data)
            .read_to_end(&mut decoded)
            .map_err(|err| Error::decode("deflate", err))?;
        Ok(Bytes::from(decoded))
    }
}

/// Built-in brotli decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrotliDecoder;

impl ContentDecoder for BrotliDecoder {
    fn name(&self) -> &str {
        "br"
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        let mut decoded = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut decoded)
            .map_err(|err| Error::decode("br", err))?;
        Ok(Bytes::from(decoded))
    }
}

/// Ordered set of decoders: custom decoders first, then the built-ins.
#[derive(Debug, Clone, Default)]
pub(crate) struct DecoderSet {
    custom: Vec<std::sync::Arc<dyn ContentDecoder>>,
}

impl DecoderSet {
    pub(crate) fn new(custom: Vec<std::sync::Arc<dyn ContentDecoder>>) -> Self {
        Self { custom }
    }

    /// The `accept-encoding` value advertising every decoder, customs first.
    pub(crate) fn accept_encoding(&self) -> String {
        let mut names: Vec<&str> = self.custom.iter().map(|d| d.name()).collect();
        for builtin in ["br", "gzip", "deflate"] {
            if !names.contains(&builtin) {
                names.push(builtin);
            }
        }
        names.join(", ")
    }

    /// Decode `data` according to `encoding`, or return it unchanged when no
    /// decoder claims the token.
    pub(crate) fn decode(&self, encoding: Option<&str>, data: Bytes) -> Result<Bytes> {
        let Some(encoding) = encoding else {
            return Ok(data);
        };
        let encoding = encoding.trim().to_ascii_lowercase();
        if encoding.is_empty() || encoding == "identity" {
            return Ok(data);
        }
        if let Some(custom) = self.custom.iter().find(|d| d.name() == encoding) {
            return custom.decode(&data);
        }
        match encoding.as_str() {
            "gzip" | "x-gzip" => GzipDecoder.decode(&data),
            "deflate" => DeflateDecoder.decode(&data),
            "br" => BrotliDecoder.decode(&data),
            _ => Ok(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzip_round_trip() {
        let encoded = gzip(b"hello world");
        let decoded = GzipDecoder.decode(&encoded).unwrap();
        assert_eq!(&decoded[..], b"hello world");
    }

    #[test]
    fn deflate_accepts_zlib_and_raw() {
        let mut zlib =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        zlib.write_all(b"payload").unwrap();
        let zlib = zlib.finish().unwrap();
        assert_eq!(&DeflateDecoder.decode(&zlib).unwrap()[..], b"payload");

        let mut raw =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        raw.write_all(b"payload").unwrap();
        let raw = raw.finish().unwrap();
        assert_eq!(&DeflateDecoder.decode(&raw).unwrap()[..], b"payload");
    }

    #[test]
    fn brotli_round_trip() {
        let mut encoded = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut encoded, 4096, 5, 22);
            writer.write_all(b"compressed with brotli").unwrap();
        }
        let decoded = BrotliDecoder.decode(&encoded).unwrap();
        assert_eq!(&decoded[..], b"compressed with brotli");
    }

    #[test]
    fn unknown_encoding_passes_through() {
        let set = DecoderSet::default();
        let raw = Bytes::from_static(b"raw bytes");
        let out = set.decode(Some("zstd"), raw.clone()).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn custom_decoder_wins_and_leads_accept_encoding() {
        struct Upper;
        impl ContentDecoder for Upper {
            fn name(&self) -> &str {
                "upper"
            }
            fn decode(&self, data: &[u8]) -> Result<Bytes> {
                Ok(Bytes::from(data.to_ascii_uppercase()))
            }
        }

        let set = DecoderSet::new(vec![std::sync::Arc::new(Upper)]);
        assert_eq!(set.accept_encoding(), "upper, br, gzip, deflate");
        let out = set.decode(Some("upper"), Bytes::from_static(b"abc")).unwrap();
        assert_eq!(&out[..], b"ABC");
    }

    #[test]
    fn truncated_gzip_is_an_error() {
        let mut encoded = gzip(b"hello world");
        encoded.truncate(encoded.len() / 2);
        let err = GzipDecoder.decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("gzip"));
    }
}
