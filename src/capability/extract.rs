//! Generic extractor helpers.
//!
//! Video hosts commonly hide player config behind Dean Edwards' packer
//! (`eval(function(p,a,c,k,e,d){...})`) and bury manifest URLs in inline
//! script text. These helpers cover both without running the packed code.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{CapabilityError, Result};

static PACKED_ARGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\}\s*\(\s*'((?:[^'\\]|\\.)*)'\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*'((?:[^'\\]|\\.)*)'\s*\.split\(\s*'\|'\s*\)",
    )
    .expect("packer pattern is valid")
});

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+\b").expect("word pattern is valid"));

static MEDIA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>\\]+?\.(?:m3u8|mp4|mpd|mkv)(?:\?[^\s"'<>\\]*)?"#)
        .expect("media url pattern is valid")
});

/// Whether `source` looks like packer output.
pub fn is_packed(source: &str) -> bool {
    source.contains("eval(function(p,a,c,k,e,") && PACKED_ARGS.is_match(source)
}

/// Unpack a `p,a,c,k,e,d` payload into the source it encodes.
pub fn unpack(source: &str) -> Result<String> {
    let caps = PACKED_ARGS
        .captures(source)
        .ok_or_else(|| CapabilityError::Decode("not packer output".to_string()))?;

    let payload = unescape(&caps[1]);
    let radix: u32 = caps[2]
        .parse()
        .map_err(|_| CapabilityError::Decode("bad radix".to_string()))?;
    let count: usize = caps[3]
        .parse()
        .map_err(|_| CapabilityError::Decode("bad word count".to_string()))?;
    let symbols: Vec<&str> = caps[4].split('|').collect();

    if !(2..=62).contains(&radix) {
        return Err(CapabilityError::Decode(format!("unsupported radix {radix}")));
    }
    if symbols.len() != count {
        return Err(CapabilityError::Decode(format!(
            "symbol table has {} entries, header says {count}",
            symbols.len()
        )));
    }

    let unpacked = WORD.replace_all(&payload, |m: &regex::Captures<'_>| {
        let word = &m[0];
        decode_radix(word, radix)
            .and_then(|idx| symbols.get(idx))
            .filter(|s| !s.is_empty())
            .map_or_else(|| word.to_string(), |s| (*s).to_string())
    });

    Ok(unpacked.into_owned())
}

/// Packer's base-N: `0-9a-zA-Z`.
fn decode_radix(word: &str, radix: u32) -> Option<usize> {
    let mut value: usize = 0;
    for ch in word.chars() {
        let digit = match ch {
            '0'..='9' => ch as u32 - '0' as u32,
            'a'..='z' => ch as u32 - 'a' as u32 + 10,
            'A'..='Z' => ch as u32 - 'A' as u32 + 36,
            _ => return None,
        };
        if digit >= radix {
            return None;
        }
        value = value.checked_mul(radix as usize)?.checked_add(digit as usize)?;
    }
    Some(value)
}

fn unescape(s: &str) -> String {
    s.replace("\\'", "'").replace("\\\\", "\\")
}

/// Media URLs (m3u8, mp4, mpd, mkv) in `text`, first occurrence order,
/// deduplicated. Escaped slashes from JSON blobs are normalized first.
pub fn find_media_urls(text: &str) -> Vec<String> {
    let text = text.replace("\\/", "/");
    let mut seen = HashSet::new();
    MEDIA_URL
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
