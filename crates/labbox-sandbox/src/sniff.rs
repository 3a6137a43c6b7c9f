//! Content-signature classification of produced files.
//!
//! Only the leading bytes of a file are inspected. Binary formats are told
//! apart by magic numbers; the file extension is consulted only to choose
//! between text formats.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How many leading bytes are read for classification and dimensions.
pub const HEADER_LIMIT: usize = 256 * 1024;

/// Closed set of recognised artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Png,
    Jpeg,
    Gif,
    Bmp,
    WebP,
    Svg,
    Pdf,
    Csv,
    Tsv,
    Json,
    Html,
    Text,
    Binary,
}

/// Coarse grouping of artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactCategory {
    Image,
    Tabular,
    Structured,
    Text,
    Binary,
}

impl ArtifactKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ArtifactKind::Png => "image/png",
            ArtifactKind::Jpeg => "image/jpeg",
            ArtifactKind::Gif => "image/gif",
            ArtifactKind::Bmp => "image/bmp",
            ArtifactKind::WebP => "image/webp",
            ArtifactKind::Svg => "image/svg+xml",
            ArtifactKind::Pdf => "application/pdf",
            ArtifactKind::Csv => "text/csv",
            ArtifactKind::Tsv => "text/tab-separated-values",
            ArtifactKind::Json => "application/json",
            ArtifactKind::Html => "text/html",
            ArtifactKind::Text => "text/plain",
            ArtifactKind::Binary => "application/octet-stream",
        }
    }

    pub fn category(&self) -> ArtifactCategory {
        match self {
            ArtifactKind::Png
            | ArtifactKind::Jpeg
            | ArtifactKind::Gif
            | ArtifactKind::Bmp
            | ArtifactKind::WebP
            | ArtifactKind::Svg => ArtifactCategory::Image,
            ArtifactKind::Csv | ArtifactKind::Tsv => ArtifactCategory::Tabular,
            ArtifactKind::Json | ArtifactKind::Html | ArtifactKind::Pdf => {
                ArtifactCategory::Structured
            }
            ArtifactKind::Text => ArtifactCategory::Text,
            ArtifactKind::Binary => ArtifactCategory::Binary,
        }
    }

    /// Pixel formats that can be inlined as the primary artifact.
    pub fn is_raster(&self) -> bool {
        matches!(
            self,
            ArtifactKind::Png
                | ArtifactKind::Jpeg
                | ArtifactKind::Gif
                | ArtifactKind::Bmp
                | ArtifactKind::WebP
        )
    }

    /// Classify from the leading bytes and, for text, the extension.
    pub fn sniff(header: &[u8], extension: Option<&str>) -> Self {
        if header.starts_with(b"\x89PNG\r\n\x1a\n") {
            return ArtifactKind::Png;
        }
        if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return ArtifactKind::Jpeg;
        }
        if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
            return ArtifactKind::Gif;
        }
        if header.starts_with(b"BM")
            && u32_le(header, 14).is_some_and(|dib| matches!(dib, 12 | 40 | 52 | 56 | 64 | 108 | 124))
        {
            return ArtifactKind::Bmp;
        }
        if header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP" {
            return ArtifactKind::WebP;
        }
        if header.starts_with(b"%PDF-") {
            return ArtifactKind::Pdf;
        }

        let Some(text) = as_text(header) else {
            return ArtifactKind::Binary;
        };

        let extension = extension.map(str::to_ascii_lowercase);
        let head = text.trim_start().get(..512).unwrap_or(text.trim_start());
        let lower = head.to_ascii_lowercase();
        let looks_svg = lower.starts_with("<svg") || (lower.starts_with("<?xml") && lower.contains("<svg"));
        let looks_html = lower.starts_with("<!doctype html") || lower.starts_with("<html");

        match extension.as_deref() {
            Some("csv") => ArtifactKind::Csv,
            Some("tsv" | "tab") => ArtifactKind::Tsv,
            Some("json" | "geojson") => ArtifactKind::Json,
            Some("html" | "htm") => ArtifactKind::Html,
            Some("svg") if looks_svg || lower.contains("<svg") => ArtifactKind::Svg,
            _ if looks_svg => ArtifactKind::Svg,
            _ if looks_html => ArtifactKind::Html,
            _ if (lower.starts_with('{') || lower.starts_with('['))
                && serde_json::from_str::<serde_json::Value>(text).is_ok() =>
            {
                ArtifactKind::Json
            }
            _ => ArtifactKind::Text,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Png => "png",
            ArtifactKind::Jpeg => "jpeg",
            ArtifactKind::Gif => "gif",
            ArtifactKind::Bmp => "bmp",
            ArtifactKind::WebP => "webp",
            ArtifactKind::Svg => "svg",
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Csv => "csv",
            ArtifactKind::Tsv => "tsv",
            ArtifactKind::Json => "json",
            ArtifactKind::Html => "html",
            ArtifactKind::Text => "text",
            ArtifactKind::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Read the pixel size out of a raster header.
///
/// Returns `None` for non-raster kinds and for headers too short or corrupt
/// to contain the size.
pub fn dimensions(kind: ArtifactKind, header: &[u8]) -> Option<Dimensions> {
    let (width, height) = match kind {
        ArtifactKind::Png => png_size(header)?,
        ArtifactKind::Gif => (u16_le(header, 6)? as u32, u16_le(header, 8)? as u32),
        ArtifactKind::Bmp => bmp_size(header)?,
        ArtifactKind::WebP => webp_size(header)?,
        ArtifactKind::Jpeg => jpeg_size(header)?,
        _ => return None,
    };
    (width > 0 && height > 0).then_some(Dimensions { width, height })
}

/// UTF-8 without NULs; a multi-byte sequence cut off by the header limit is fine.
fn as_text(header: &[u8]) -> Option<&str> {
    if header.contains(&0) {
        return None;
    }
    match std::str::from_utf8(header) {
        Ok(text) => Some(text),
        Err(e) if e.error_len().is_none() && header.len() - e.valid_up_to() < 4 => {
            std::str::from_utf8(&header[..e.valid_up_to()]).ok()
        }
        Err(_) => None,
    }
}

fn u16_le(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(at..at + 2)?.try_into().ok()?))
}

fn u16_be(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(b.get(at..at + 2)?.try_into().ok()?))
}

fn u32_le(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn u32_be(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn u24_le(b: &[u8], at: usize) -> Option<u32> {
    let bytes = b.get(at..at + 3)?;
    Some(u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16)
}

fn png_size(b: &[u8]) -> Option<(u32, u32)> {
    if b.get(12..16)? != b"IHDR" {
        return None;
    }
    Some((u32_be(b, 16)?, u32_be(b, 20)?))
}

fn bmp_size(b: &[u8]) -> Option<(u32, u32)> {
    let dib_size = u32_le(b, 14)?;
    if dib_size == 12 {
        return Some((u16_le(b, 18)? as u32, u16_le(b, 20)? as u32));
    }
    let width = u32_le(b, 18)? as i32;
    let height = u32_le(b, 22)? as i32;
    Some((width.unsigned_abs(), height.unsigned_abs()))
}

fn webp_size(b: &[u8]) -> Option<(u32, u32)> {
    match b.get(12..16)? {
        b"VP8 " => {
            if b.get(23..26)? != [0x9D, 0x01, 0x2A] {
                return None;
            }
            let width = u16_le(b, 26)? & 0x3FFF;
            let height = u16_le(b, 28)? & 0x3FFF;
            Some((width as u32, height as u32))
        }
        b"VP8L" => {
            if *b.get(20)? != 0x2F {
                return None;
            }
            let bits = u32_le(b, 21)?;
            Some(((bits & 0x3FFF) + 1, ((bits >> 14) & 0x3FFF) + 1))
        }
        b"VP8X" => Some((u24_le(b, 24)? + 1, u24_le(b, 27)? + 1)),
        _ => None,
    }
}

fn jpeg_size(b: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 1 < b.len() {
        if b[i] != 0xFF {
            return None;
        }
        let marker = b[i + 1];
        match marker {
            0xFF => {
                i += 1;
                continue;
            }
            0xD8 | 0x01 | 0xD0..=0xD7 => {
                i += 2;
                continue;
            }
            0xD9 | 0xDA => return None,
            _ => {}
        }
        let length = u16_be(b, i + 2)? as usize;
        if length < 2 {
            return None;
        }
        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let height = u16_be(b, i + 5)?;
            let width = u16_be(b, i + 7)?;
            return Some((width as u32, height as u32));
        }
        i += 2 + length;
    }
    None
}
