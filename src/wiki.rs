/*
    img3patch - An IMG3 decrypter, LZSS codec and kernelcache patcher
    Copyright (C) 2024 plzdonthaxme

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Pulls keys out of a saved firmware key wiki page.
//!
//! The page is not parsed as HTML, the scraper relies on the layout the key
//! pages use: a heading (`<span>` or `<a>`) naming the file, followed by a
//! list with `<b>IV</b>: ...` and `<b>Key</b>: ...` items.

use {
    crate::keystore::DecryptionInfo,
    log::debug,
    memchr::{memchr, memmem},
};

const IV_LABEL: &str = "<b>IV</b>";
const KEY_LABEL: &str = "<b>Key</b>";

// name of the tag starting at `pos`, which points at a '<'
fn tag_name(html: &str, pos: usize) -> &str {
    let rest = &html[pos + 1..];
    let end = rest
        .bytes()
        .position(|b| !b.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    &rest[..end]
}

// text between the end of the tag at `pos` and the next tag
fn inner_text(html: &str, pos: usize) -> Option<&str> {
    let open_end = pos + memchr(b'>', &html.as_bytes()[pos..])? + 1;
    let len = memchr(b'<', &html.as_bytes()[open_end..]).unwrap_or(html.len() - open_end);
    Some(html[open_end..open_end + len].trim())
}

// value after `label`, either bare up to the end of the line or wrapped in one tag
fn labelled_value<'a>(body: &'a str, label: &str) -> Option<&'a str> {
    let at = memmem::find(body.as_bytes(), label.as_bytes())? + label.len();
    let colon = at + memchr(b':', &body.as_bytes()[at..])? + 1;
    let rest = body[colon..].trim_start_matches(' ');
    let value = if rest.starts_with('<') {
        let start = memchr(b'>', rest.as_bytes())? + 1;
        let len = memchr(b'<', &rest.as_bytes()[start..]).unwrap_or(rest.len() - start);
        &rest[start..start + len]
    } else {
        let len = memchr(b'\n', rest.as_bytes()).unwrap_or(rest.len());
        let line = &rest[..len];
        &line[..memchr(b'<', line.as_bytes()).unwrap_or(line.len())]
    };
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// Finds every key/IV pair on the page.
///
/// Lists without a name in front of them, or without both values, are dropped.
#[must_use]
pub fn scrape(html: &str) -> Vec<DecryptionInfo> {
    let bytes = html.as_bytes();
    let mut infos = Vec::new();
    let mut name: Option<&str> = None;
    let mut pos = 0;

    while let Some(off) = memchr(b'<', &bytes[pos..]) {
        let start = pos + off;
        let rest = &html[start..];

        if rest.starts_with("<!--") {
            pos = memmem::find(&bytes[start..], b"-->").map_or(bytes.len(), |e| start + e + 3);
            continue;
        }

        match tag_name(html, start).to_ascii_lowercase().as_str() {
            "span" | "a" => {
                if let Some(text) = inner_text(html, start).filter(|t| !t.is_empty()) {
                    name = Some(text);
                }
            }
            "ul" => {
                let end = memmem::find(&bytes[start..], b"</ul>").map_or(bytes.len(), |e| start + e);
                let body = &html[start..end];
                if memmem::find(body.as_bytes(), IV_LABEL.as_bytes()).is_some() {
                    let iv = labelled_value(body, IV_LABEL);
                    let key = labelled_value(body, KEY_LABEL);
                    if let (Some(section), Some(iv), Some(key)) = (name, iv, key) {
                        debug!("Found {section}: iv {iv} key {key}");
                        infos.push(DecryptionInfo {
                            section: section.to_lowercase(),
                            iv: iv.to_string(),
                            key: key.to_string(),
                        });
                    } else {
                        debug!("Skipping incomplete key list at {start:#x}");
                    }
                }
                pos = end;
                continue;
            }
            _ => {}
        }
        pos = start + 1;
    }
    infos
}
