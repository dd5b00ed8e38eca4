//! Local decoding of the node's base64 track blobs.
//!
//! The blob is a Java `DataOutput` message: a header int carrying flags and
//! size, an optional version byte, then the track fields. Strings use Java's
//! modified UTF-8.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::TrackInfo;
use crate::{Error, Result};

const FLAG_VERSIONED: u32 = 1;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(Error::Decode(format!(
                "unexpected end of data at byte {} (wanted {count})",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_utf(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        decode_modified_utf8(bytes)
    }

    fn read_nullable_utf(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            self.read_utf().map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Decodes Java modified UTF-8 (surrogate pairs encoded as two 3-byte units).
fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c >> 4 {
            0..=7 => {
                units.push(c as u16);
                i += 1;
            }
            12 | 13 => {
                let c2 = *bytes
                    .get(i + 1)
                    .ok_or_else(|| Error::Decode("partial character at end".into()))?;
                if c2 & 0xC0 != 0x80 {
                    return Err(Error::Decode(format!("malformed input around byte {i}")));
                }
                units.push((((c & 0x1F) as u16) << 6) | (c2 & 0x3F) as u16);
                i += 2;
            }
            14 => {
                let (c2, c3) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(&c2), Some(&c3)) => (c2, c3),
                    _ => return Err(Error::Decode("partial character at end".into())),
                };
                if c2 & 0xC0 != 0x80 || c3 & 0xC0 != 0x80 {
                    return Err(Error::Decode(format!("malformed input around byte {i}")));
                }
                units.push(
                    (((c & 0x0F) as u16) << 12) | (((c2 & 0x3F) as u16) << 6) | (c3 & 0x3F) as u16,
                );
                i += 3;
            }
            _ => return Err(Error::Decode(format!("malformed input around byte {i}"))),
        }
    }

    String::from_utf16(&units).map_err(|e| Error::Decode(e.to_string()))
}

/// Skips source-specific fields written between the source name and the
/// position.
fn skip_source_fields(reader: &mut Reader<'_>, source: &str) -> Result<()> {
    match source {
        "http" | "local" => {
            reader.read_utf()?;
        }
        "deezer" | "spotify" | "applemusic" | "yandexmusic" | "vkmusic" => {
            if reader.remaining() > 8 {
                for _ in 0..5 {
                    reader.read_nullable_utf()?;
                }
                reader.read_bool()?;
            }
        }
        _ => {}
    }
    Ok(())
}

pub(crate) fn decode_track(encoded: &str) -> Result<TrackInfo> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Decode(e.to_string()))?;
    let mut reader = Reader::new(&raw);

    let header = reader.read_i32()? as u32;
    let flags = (header >> 30) & 0b11;
    let version = if flags & FLAG_VERSIONED != 0 {
        reader.read_u8()?
    } else {
        1
    };

    let title = reader.read_utf()?;
    let author = reader.read_utf()?;
    let length = reader.read_u64()?;
    let identifier = reader.read_utf()?;
    let is_stream = reader.read_bool()?;
    let uri = if version >= 2 {
        reader.read_nullable_utf()?
    } else {
        None
    };
    let (artwork_url, isrc) = if version >= 3 {
        (reader.read_nullable_utf()?, reader.read_nullable_utf()?)
    } else {
        (None, None)
    };
    let source_name = reader.read_utf()?;
    skip_source_fields(&mut reader, &source_name)?;
    let position = reader.read_u64()?;

    Ok(TrackInfo {
        identifier,
        is_seekable: !is_stream,
        author,
        length,
        is_stream,
        position,
        title,
        uri,
        artwork_url,
        isrc,
        source_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Writer(Vec<u8>);

    impl Writer {
        fn utf(&mut self, s: &str) -> &mut Self {
            self.0.extend_from_slice(&(s.len() as u16).to_be_bytes());
            self.0.extend_from_slice(s.as_bytes());
            self
        }
        fn nullable(&mut self, s: Option<&str>) -> &mut Self {
            match s {
                Some(s) => {
                    self.0.push(1);
                    self.utf(s)
                }
                None => {
                    self.0.push(0);
                    self
                }
            }
        }
        fn u64(&mut self, v: u64) -> &mut Self {
            self.0.extend_from_slice(&v.to_be_bytes());
            self
        }
        fn byte(&mut self, v: u8) -> &mut Self {
            self.0.push(v);
            self
        }
        fn finish(&self) -> String {
            let mut out = Vec::new();
            let header = (1u32 << 30) | self.0.len() as u32;
            out.extend_from_slice(&header.to_be_bytes());
            out.extend_from_slice(&self.0);
            STANDARD.encode(out)
        }
    }

    #[test]
    fn test_decode_v3_youtube_track() {
        let mut w = Writer::default();
        w.byte(3)
            .utf("Never Gonna Give You Up")
            .utf("Rick Astley")
            .u64(212_000)
            .utf("dQw4w9WgXcQ")
            .byte(0)
            .nullable(Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ"))
            .nullable(None)
            .nullable(Some("GBARL9300135"))
            .utf("youtube")
            .u64(0);

        let info = decode_track(&w.finish()).unwrap();
        assert_eq!(info.title, "Never Gonna Give You Up");
        assert_eq!(info.author, "Rick Astley");
        assert_eq!(info.length, 212_000);
        assert_eq!(info.identifier, "dQw4w9WgXcQ");
        assert!(!info.is_stream);
        assert_eq!(info.isrc.as_deref(), Some("GBARL9300135"));
        assert_eq!(info.artwork_url, None);
        assert_eq!(info.source_name, "youtube");
    }

    #[test]
    fn test_decode_http_skips_probe_info() {
        let mut w = Writer::default();
        w.byte(2)
            .utf("stream")
            .utf("radio")
            .u64(0)
            .utf("http://radio/live")
            .byte(1)
            .nullable(Some("http://radio/live"))
            .utf("http")
            .utf("mp3")
            .u64(42);

        let info = decode_track(&w.finish()).unwrap();
        assert!(info.is_stream);
        assert_eq!(info.position, 42);
        assert_eq!(info.source_name, "http");
    }

    #[test]
    fn test_modified_utf8_surrogates() {
        // U+1F600 como par sustituto estilo CESU.
        let bytes = [0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80];
        assert_eq!(decode_modified_utf8(&bytes).unwrap(), "\u{1F600}");
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let err = decode_track("QAAA").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
