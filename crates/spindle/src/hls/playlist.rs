// HLS Playlist Parser: turns one playlist document into ordered segment descriptors.
//
// Parsing is two-pass. A line scanner validates the tags this engine depends on and
// records where each URI and key directive lives, so errors can name their line.
// m3u8-rs then provides the document structure (durations, byte ranges, variants).

use m3u8_rs::{MasterPlaylist, MediaPlaylist, parse_playlist_res};
use tracing::{debug, trace};
use url::Url;

use crate::config::VariantSelection;
use crate::error::ParseError;
use crate::transport::ByteRange;

/// One media segment, in final output order.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Position in the assembled output, 0-based and contiguous
    pub ordinal: u64,
    /// Media sequence number (`EXT-X-MEDIA-SEQUENCE` + index), used for IV derivation
    pub sequence: u64,
    pub url: String,
    pub duration: f64,
    pub range: Option<ByteRange>,
    /// Absolute key URI when the segment is AES-128 encrypted
    pub key_uri: Option<String>,
    /// Explicit IV from the key directive
    pub iv: Option<[u8; 16]>,
}

impl Segment {
    pub fn is_encrypted(&self) -> bool {
        self.key_uri.is_some()
    }
}

/// A variant stream of a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub url: String,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
    pub codecs: Option<String>,
}

/// `EXT-X-MAP` initialization section, written ahead of the first segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSection {
    pub url: String,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Playlist {
    /// A master playlist lists variants and has no segments
    pub is_master: bool,
    pub segments: Vec<Segment>,
    pub variants: Vec<Variant>,
    pub init_section: Option<InitSection>,
    pub media_sequence: u64,
    pub target_duration: Option<u64>,
    pub end_list: bool,
}

impl Playlist {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Distinct key URIs, in first-use order.
    pub fn key_uris(&self) -> Vec<&str> {
        let mut uris: Vec<&str> = Vec::new();
        for uri in self.segments.iter().filter_map(|s| s.key_uri.as_deref()) {
            if !uris.contains(&uri) {
                uris.push(uri);
            }
        }
        uris
    }
}

/// Parse a playlist document. Relative URIs are resolved against `base_url`
/// (normally the URL the document was fetched from).
pub fn parse(document: &str, base_url: &Url) -> Result<Playlist, ParseError> {
    let scanned = scan(document)?;

    let parsed = parse_playlist_res(document.as_bytes()).map_err(|e| {
        let mut reason = format!("unrecognized playlist structure: {e}");
        reason.truncate(200);
        ParseError::new(1, reason)
    })?;

    let playlist = match parsed {
        m3u8_rs::Playlist::MasterPlaylist(master) if scanned.is_master => {
            build_master(&master, &scanned, base_url)?
        }
        m3u8_rs::Playlist::MediaPlaylist(media) if !scanned.is_master => {
            build_media(&media, &scanned, base_url)?
        }
        _ => {
            return Err(ParseError::new(
                1,
                "playlist type could not be determined consistently",
            ));
        }
    };

    debug!(
        is_master = playlist.is_master,
        segments = playlist.segments.len(),
        variants = playlist.variants.len(),
        "Parsed playlist"
    );
    Ok(playlist)
}

/// Pick the variant to download. I-frame-only variants are never candidates.
pub fn select_variant(variants: &[Variant], policy: VariantSelection) -> Option<&Variant> {
    match policy {
        VariantSelection::HighestBandwidth => variants.iter().max_by_key(|v| v.bandwidth),
        VariantSelection::LowestBandwidth => variants.iter().min_by_key(|v| v.bandwidth),
        VariantSelection::ClosestTo(target) => variants
            .iter()
            .min_by_key(|v| v.bandwidth.abs_diff(target)),
    }
}

fn resolve(base_url: &Url, uri: &str, line: usize, what: &str) -> Result<String, ParseError> {
    let resolved = base_url
        .join(uri.trim())
        .map_err(|e| ParseError::new(line, format!("cannot resolve {what} URI `{uri}`: {e}")))?;
    trace!("Resolved URI: {} + {} -> {}", base_url, uri, resolved);
    Ok(resolved.to_string())
}

fn build_master(
    master: &MasterPlaylist,
    scanned: &ScannedDocument,
    base_url: &Url,
) -> Result<Playlist, ParseError> {
    let streams: Vec<_> = master.variants.iter().filter(|v| !v.is_i_frame).collect();
    if streams.len() != scanned.uris.len() {
        return Err(ParseError::new(
            1,
            format!(
                "found {} variant URIs but {} variant streams",
                scanned.uris.len(),
                streams.len()
            ),
        ));
    }

    let variants = streams
        .into_iter()
        .zip(&scanned.uris)
        .map(|(stream, uri)| {
            Ok(Variant {
                url: resolve(base_url, &stream.uri, uri.line, "variant")?,
                bandwidth: stream.bandwidth,
                resolution: stream.resolution.as_ref().map(|r| (r.width, r.height)),
                codecs: stream.codecs.clone(),
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    Ok(Playlist {
        is_master: true,
        variants,
        ..Default::default()
    })
}

fn build_media(
    media: &MediaPlaylist,
    scanned: &ScannedDocument,
    base_url: &Url,
) -> Result<Playlist, ParseError> {
    if media.segments.len() != scanned.uris.len() {
        return Err(ParseError::new(
            1,
            format!(
                "found {} segment URIs but {} segments",
                scanned.uris.len(),
                media.segments.len()
            ),
        ));
    }

    let mut key_urls: Vec<String> = Vec::with_capacity(scanned.keys.len());
    for key in &scanned.keys {
        key_urls.push(resolve(base_url, &key.uri, key.line, "key")?);
    }

    let mut segments = Vec::with_capacity(media.segments.len());
    let mut last_range: Option<(String, u64)> = None;

    for (index, (segment, scanned_uri)) in media.segments.iter().zip(&scanned.uris).enumerate() {
        let line = scanned_uri.line;
        let url = resolve(base_url, &segment.uri, line, "segment")?;

        let range = match segment.byte_range.as_ref() {
            Some(byte_range) => {
                let offset = match byte_range.offset {
                    Some(offset) => offset,
                    None => match &last_range {
                        Some((previous_url, end)) if *previous_url == url => *end,
                        _ => {
                            return Err(ParseError::new(
                                line,
                                "byte range without offset does not follow a range of the same resource",
                            ));
                        }
                    },
                };
                let range = ByteRange::new(offset, byte_range.length);
                last_range = Some((url.clone(), range.end()));
                Some(range)
            }
            None => {
                last_range = None;
                None
            }
        };

        let (key_uri, iv) = match scanned_uri.key {
            Some(key_index) => (
                Some(key_urls[key_index].clone()),
                scanned.keys[key_index].iv,
            ),
            None => (None, None),
        };

        let ordinal = index as u64;
        let sequence = media
            .media_sequence
            .checked_add(ordinal)
            .ok_or_else(|| ParseError::new(line, "media sequence overflows"))?;
        segments.push(Segment {
            ordinal,
            sequence,
            url,
            duration: f64::from(segment.duration),
            range,
            key_uri,
            iv,
        });
    }

    let init_section = match &scanned.map {
        Some(map) => Some(InitSection {
            url: resolve(base_url, &map.uri, map.line, "initialization section")?,
            range: map.range,
        }),
        None => None,
    };

    Ok(Playlist {
        is_master: false,
        segments,
        variants: Vec::new(),
        init_section,
        media_sequence: media.media_sequence,
        target_duration: scanned.target_duration,
        end_list: media.end_list,
    })
}

// --- Line scanner ---

#[derive(Debug, Default)]
struct ScannedDocument {
    is_master: bool,
    target_duration: Option<u64>,
    uris: Vec<ScannedUri>,
    keys: Vec<ScannedKey>,
    map: Option<ScannedMap>,
}

#[derive(Debug)]
struct ScannedUri {
    line: usize,
    /// Index into `ScannedDocument::keys` of the key in force for this URI
    key: Option<usize>,
}

#[derive(Debug)]
struct ScannedKey {
    line: usize,
    uri: String,
    iv: Option<[u8; 16]>,
}

#[derive(Debug)]
struct ScannedMap {
    line: usize,
    uri: String,
    range: Option<ByteRange>,
}

const MASTER_TAGS: &[&str] = &["#EXT-X-STREAM-INF", "#EXT-X-I-FRAME-STREAM-INF", "#EXT-X-MEDIA:"];
const MEDIA_TAGS: &[&str] = &["#EXTINF", "#EXT-X-TARGETDURATION", "#EXT-X-KEY", "#EXT-X-MAP"];

fn scan(document: &str) -> Result<ScannedDocument, ParseError> {
    let mut lines = document
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    let header_line = match lines.next() {
        Some((line, "#EXTM3U")) => line,
        Some((line, _)) => return Err(ParseError::new(line, "missing #EXTM3U header")),
        None => return Err(ParseError::new(1, "empty playlist document")),
    };

    let mut doc = ScannedDocument::default();
    let mut kind: Option<(bool, usize)> = None;
    let mut pending_entry: Option<usize> = None;
    let mut active_key: Option<usize> = None;
    // segment tags may precede #EXTINF; they stay open until the next URI
    let mut open_byte_range: Option<usize> = None;

    for (line, text) in lines {
        let is_master_tag = MASTER_TAGS.iter().any(|t| text.starts_with(t));
        let is_media_tag = MEDIA_TAGS.iter().any(|t| text.starts_with(t));
        if is_master_tag || is_media_tag {
            match kind {
                None => kind = Some((is_master_tag, line)),
                Some((master, first)) if master != is_master_tag => {
                    return Err(ParseError::new(
                        line,
                        format!("master and media tags mixed (first seen on line {first})"),
                    ));
                }
                Some(_) => {}
            }
        }

        if let Some(value) = text.strip_prefix("#EXTINF:") {
            if let Some(open) = pending_entry {
                return Err(ParseError::new(open, "#EXTINF is not followed by a URI"));
            }
            let duration = value.split(',').next().unwrap_or("").trim();
            if duration.parse::<f64>().map_or(true, |d| !d.is_finite() || d < 0.0) {
                return Err(ParseError::new(line, format!("invalid segment duration `{duration}`")));
            }
            pending_entry = Some(line);
        } else if text.starts_with("#EXT-X-STREAM-INF") {
            if let Some(open) = pending_entry {
                return Err(ParseError::new(open, "entry is not followed by a URI"));
            }
            let attributes = parse_attributes(text.split_once(':').map_or("", |(_, a)| a));
            let has_bandwidth = attribute(&attributes, "BANDWIDTH")
                .is_some_and(|b| b.parse::<u64>().is_ok());
            if !has_bandwidth {
                return Err(ParseError::new(line, "#EXT-X-STREAM-INF without a valid BANDWIDTH"));
            }
            pending_entry = Some(line);
        } else if let Some(value) = text.strip_prefix("#EXT-X-TARGETDURATION:") {
            let target = value.trim().parse::<u64>().map_err(|_| {
                ParseError::new(line, format!("invalid target duration `{}`", value.trim()))
            })?;
            doc.target_duration = Some(target);
        } else if let Some(value) = text.strip_prefix("#EXT-X-BYTERANGE:") {
            parse_byte_range(value, line)?;
            open_byte_range.get_or_insert(line);
        } else if let Some(value) = text.strip_prefix("#EXT-X-KEY:") {
            active_key = scan_key(value, line, &mut doc.keys)?;
        } else if let Some(value) = text.strip_prefix("#EXT-X-MAP:") {
            if doc.map.is_none() {
                doc.map = Some(scan_map(value, line)?);
            }
        } else if !text.starts_with('#') {
            let Some(_) = pending_entry.take() else {
                return Err(ParseError::new(
                    line,
                    format!("URI `{text}` is not preceded by #EXTINF or #EXT-X-STREAM-INF"),
                ));
            };
            doc.uris.push(ScannedUri {
                line,
                key: active_key,
            });
            open_byte_range = None;
        }
    }

    if let Some(open) = pending_entry.or(open_byte_range) {
        return Err(ParseError::new(open, "entry is not followed by a URI"));
    }

    doc.is_master = kind.is_some_and(|(master, _)| master);
    if doc.uris.is_empty() {
        return Err(ParseError::new(
            header_line,
            "playlist contains no segments or variant streams",
        ));
    }
    if !doc.is_master && doc.target_duration.is_none() {
        return Err(ParseError::new(
            header_line,
            "media playlist is missing #EXT-X-TARGETDURATION",
        ));
    }

    Ok(doc)
}

/// Validate a key directive. Returns the index of the key now in force, or `None`
/// when the directive switches encryption off.
fn scan_key(
    value: &str,
    line: usize,
    keys: &mut Vec<ScannedKey>,
) -> Result<Option<usize>, ParseError> {
    let attributes = parse_attributes(value);
    let method = attribute(&attributes, "METHOD")
        .ok_or_else(|| ParseError::new(line, "#EXT-X-KEY without METHOD"))?;

    match method {
        "NONE" => Ok(None),
        "AES-128" => {
            let uri = attribute(&attributes, "URI")
                .filter(|u| !u.is_empty())
                .ok_or_else(|| ParseError::new(line, "AES-128 key without URI"))?;
            let iv = attribute(&attributes, "IV")
                .map(|iv| parse_iv(iv, line))
                .transpose()?;
            keys.push(ScannedKey {
                line,
                uri: uri.to_string(),
                iv,
            });
            Ok(Some(keys.len() - 1))
        }
        other => Err(ParseError::new(
            line,
            format!("unsupported encryption method `{other}`"),
        )),
    }
}

fn scan_map(value: &str, line: usize) -> Result<ScannedMap, ParseError> {
    let attributes = parse_attributes(value);
    let uri = attribute(&attributes, "URI")
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ParseError::new(line, "#EXT-X-MAP without URI"))?;
    let range = match attribute(&attributes, "BYTERANGE") {
        Some(spec) => {
            let (length, offset) = parse_byte_range(spec, line)?;
            Some(ByteRange::new(offset.unwrap_or(0), length))
        }
        None => None,
    };
    Ok(ScannedMap {
        line,
        uri: uri.to_string(),
        range,
    })
}

fn parse_byte_range(value: &str, line: usize) -> Result<(u64, Option<u64>), ParseError> {
    let invalid = || ParseError::new(line, format!("invalid byte range `{value}`"));
    let (length, offset) = match value.trim().split_once('@') {
        Some((length, offset)) => (length, Some(offset)),
        None => (value.trim(), None),
    };
    let length = length.parse::<u64>().map_err(|_| invalid())?;
    let offset = offset
        .map(|o| o.parse::<u64>().map_err(|_| invalid()))
        .transpose()?;
    Ok((length, offset))
}

/// Parse a 128-bit hexadecimal IV (`0x` prefixed, 32 digits).
fn parse_iv(value: &str, line: usize) -> Result<[u8; 16], ParseError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| ParseError::new(line, format!("IV `{value}` is not 0x-prefixed")))?;
    let mut iv = [0u8; 16];
    hex::decode_to_slice(digits, &mut iv)
        .map_err(|e| ParseError::new(line, format!("invalid IV `{value}`: {e}")))?;
    Ok(iv)
}

/// Split an attribute list (`KEY=VALUE,KEY="quoted, value"`) into pairs.
fn parse_attributes(input: &str) -> Vec<(&str, &str)> {
    let mut attributes = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((name, after)) = rest.split_once('=') else {
            break;
        };
        let name = name.trim();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((value, tail)) => (value, tail.trim_start_matches(|c| c != ',')),
                None => (quoted, ""),
            }
        } else {
            match after.split_once(',') {
                Some((value, tail)) => (value, tail),
                None => (after, ""),
            }
        };
        attributes.push((name, value.trim()));
        rest = remaining.strip_prefix(',').unwrap_or(remaining).trim_start();
    }

    attributes
}

fn attribute<'a>(attributes: &[(&str, &'a str)], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| *value)
}
