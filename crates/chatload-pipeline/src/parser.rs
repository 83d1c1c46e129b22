// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chat log parser: one UTF-16 log in, per-character activity records out.
//!
//! A log starts with a header naming the channel, followed by message lines
//! of the form `[ YYYY.MM.DD HH:MM:SS ] NAME > TEXT`. Only the timestamp and
//! the sender name are retained; sightings of the same name are aggregated
//! into `(first seen, last seen, message count)` per log.
//!
//! Logs are written by a third party without synchronization, so damaged
//! lines are expected: every per-line failure skips forward to the next `[`
//! and keeps going.
//!
//! # Record encoding
//!
//! Each aggregated entry is appended to the output buffer as
//!
//! ```text
//! name_utf8 0x1E channel_utf8 0x1E first_le64 last_le64 count_le64 0x1D
//! ```
//!
//! Entries are emitted in lexicographic order of the name's UTF-16 code
//! units, so identical input bytes always produce identical output bytes.

use std::collections::BTreeMap;

use chrono::NaiveDate;

/// Separates the elements of one record.
pub const RECORD_SEP: u8 = 0x1E;
/// Separates records from each other.
pub const GROUP_SEP: u8 = 0x1D;

/// `[ YYYY.MM.DD HH:MM:SS ] `, fixed-width, including the trailing space.
const TIME_HEADER_LEN: usize = 24;

// Name constraints from the character naming policy: up to 24 characters of
// first (and middle) name, up to 12 of family name, 3 characters minimum.
const MIN_NAME_LEN: usize = 3;
const MAX_FIRST_LEN: usize = 24;
const MAX_FAMILY_LEN: usize = 12;
const MAX_NUM_SPACES: u8 = 2;

const SPACE: u16 = b' ' as u16;
const NEWLINE: u16 = b'\n' as u16;
const OPEN_BRACKET: u16 = b'[' as u16;
const GREATER: u16 = b'>' as u16;

/// Aggregation state for one character within one log.
#[derive(Debug, Clone, Copy)]
struct CharEntry {
    first_msg: i64,
    last_msg: i64,
    msg_count: u64,
}

impl CharEntry {
    fn new(initial_msg: i64) -> Self {
        CharEntry {
            first_msg: initial_msg,
            last_msg: initial_msg,
            msg_count: 1,
        }
    }

    fn update(&mut self, latest_msg: i64) {
        self.last_msg = latest_msg;
        self.msg_count += 1;
    }
}

/// Byte range of one record within [`ParserResult::bytes`]. The key part is
/// the `name 0x1E channel 0x1E` prefix identifying the record.
#[derive(Debug, Clone, Copy)]
struct EntrySpan {
    start: usize,
    key_len: usize,
    len: usize,
}

/// One encoded record, borrowed from a [`ParserResult`].
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// `name 0x1E channel 0x1E`, the record's identity for deduplication.
    pub key: &'a [u8],
    /// The full encoded record, terminator included.
    pub bytes: &'a [u8],
}

/// All records produced from one log.
#[derive(Debug, Default)]
pub struct ParserResult {
    bytes: Vec<u8>,
    spans: Vec<EntrySpan>,
}

impl ParserResult {
    pub fn report_count(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// The raw record buffer, all entries concatenated.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.spans.iter().map(|span| Record {
            key: &self.bytes[span.start..span.start + span.key_len],
            bytes: &self.bytes[span.start..span.start + span.len],
        })
    }
}

/// Reusable log parser. One instance is shared across all logs of a run.
#[derive(Debug)]
pub struct LogParser {
    channel_head: Vec<u16>,
    eve_system: Vec<u16>,
}

impl LogParser {
    pub fn new() -> Self {
        LogParser {
            channel_head: "Channel Name:".encode_utf16().collect(),
            // Not a real character: it posts the MOTD in every channel.
            eve_system: "EVE System".encode_utf16().collect(),
        }
    }

    /// Parse one log. Returns an empty result if the header is missing or no
    /// line yields a valid record; never fails.
    pub fn parse(&mut self, log: &[u16]) -> ParserResult {
        let mut res = ParserResult::default();

        let Some((channel, mut rest)) = self.parse_head(log) else {
            return res;
        };
        if channel.is_empty() {
            return res;
        }

        let mut char_map: BTreeMap<&[u16], CharEntry> = BTreeMap::new();

        let mut force_progress = false;
        while let Some(line) = strip_remainder(rest, force_progress) {
            rest = line;

            let Some(msg_time) = parse_time(&mut rest) else {
                force_progress = true;
                continue;
            };

            let Some(char_name) = parse_name(&mut rest) else {
                force_progress = true;
                continue;
            };
            force_progress = false;
            if char_name == self.eve_system.as_slice() {
                continue;
            }

            char_map
                .entry(char_name)
                .and_modify(|entry| entry.update(msg_time))
                .or_insert_with(|| CharEntry::new(msg_time));
        }

        if char_map.is_empty() {
            return res;
        }

        let channel_utf8 = String::from_utf16_lossy(channel);
        // ~16 bytes of name plus channel, three 64-bit fields and separators
        // per entry.
        res.bytes
            .reserve(char_map.len() * (16 + channel_utf8.len() + 24 + 3));
        res.spans.reserve(char_map.len());

        for (name, entry) in &char_map {
            let start = res.bytes.len();
            let name_utf8 = String::from_utf16_lossy(name);

            res.bytes.extend_from_slice(name_utf8.as_bytes());
            res.bytes.push(RECORD_SEP);
            res.bytes.extend_from_slice(channel_utf8.as_bytes());
            res.bytes.push(RECORD_SEP);
            let key_len = res.bytes.len() - start;

            res.bytes.extend_from_slice(&entry.first_msg.to_le_bytes());
            res.bytes.extend_from_slice(&entry.last_msg.to_le_bytes());
            res.bytes.extend_from_slice(&entry.msg_count.to_le_bytes());
            res.bytes.push(GROUP_SEP);

            res.spans.push(EntrySpan {
                start,
                key_len,
                len: res.bytes.len() - start,
            });
        }

        res
    }

    /// Locate the channel name in the log header. Returns the name and the
    /// remainder of the log following the header line.
    fn parse_head<'a>(&self, log: &'a [u16]) -> Option<(&'a [u16], &'a [u16])> {
        let head = find_subslice(log, &self.channel_head)?;
        let after_head = &log[head + self.channel_head.len()..];

        let val_start = after_head.iter().position(|&c| c != SPACE)?;
        let value = &after_head[val_start..];
        let val_end = value.iter().position(|&c| c == NEWLINE)?;

        Some((&value[..val_end], &value[val_end + 1..]))
    }
}

impl Default for LogParser {
    fn default() -> Self {
        LogParser::new()
    }
}

/// Advance to the next `[`, which starts every message line. `force_progress`
/// skips at least one code unit so a failed line cannot stall the scan.
fn strip_remainder(log: &[u16], force_progress: bool) -> Option<&[u16]> {
    let from = usize::from(force_progress);
    let idx = log.get(from..)?.iter().position(|&c| c == OPEN_BRACKET)?;
    Some(&log[from + idx..])
}

/// Parse the fixed-width `[ YYYY.MM.DD HH:MM:SS ] ` message header into UTC
/// epoch seconds, stripping it from `rest` on success.
fn parse_time(rest: &mut &[u16]) -> Option<i64> {
    let log = *rest;
    if log.len() <= TIME_HEADER_LEN {
        return None;
    }

    const LITERALS: [(usize, u8); 10] = [
        (0, b'['),
        (1, b' '),
        (6, b'.'),
        (9, b'.'),
        (12, b' '),
        (15, b':'),
        (18, b':'),
        (21, b' '),
        (22, b']'),
        (23, b' '),
    ];
    for (idx, lit) in LITERALS {
        if log[idx] != u16::from(lit) {
            return None;
        }
    }

    let year = parse_digits(&log[2..6])?;
    let month = parse_digits(&log[7..9])?;
    let day = parse_digits(&log[10..12])?;
    let hour = parse_digits(&log[13..15])?;
    let minute = parse_digits(&log[16..18])?;
    let second = parse_digits(&log[19..21])?;

    if !(1..=12).contains(&month)
        || !(1..=31).contains(&day)
        || hour > 23
        || minute > 59
        || second > 60
    {
        return None;
    }

    // Log times are always UTC. A leap second composes as :59 plus one.
    let leap = u32::from(second == 60);
    let timestamp = NaiveDate::from_ymd_opt(year as i32, month, day)?
        .and_hms_opt(hour, minute, second - leap)?
        .and_utc()
        .timestamp()
        + i64::from(leap);

    *rest = &log[TIME_HEADER_LEN..];
    Some(timestamp)
}

fn parse_digits(units: &[u16]) -> Option<u32> {
    let mut res = 0u32;
    for &c in units {
        if !(0x30..=0x39).contains(&c) {
            return None;
        }
        res = res * 10 + u32::from(c - 0x30);
    }
    Some(res)
}

/// Parse a sender name adhering to the naming policy, stripping it from
/// `rest` on success. The name must be terminated by the ` >` lookahead.
fn parse_name<'a>(rest: &mut &'a [u16]) -> Option<&'a [u16]> {
    let log = *rest;

    // One space between first and family name, two units of ` >` lookahead.
    let max_len = log.len().min(MAX_FIRST_LEN + MAX_FAMILY_LEN + 1 + 2);
    let mut name_len = 0usize;
    let mut first_len = 0usize;
    let mut num_spaces = 0u8;

    while name_len < max_len {
        let cur = log[name_len];
        if !is_allowed_char(cur) {
            // Invalid character, improper termination, or a repeated space
            // all discard the line.
            if cur != SPACE || name_len + 1 >= max_len || log[name_len + 1] == SPACE {
                return None;
            }

            // Name is complete; go on to verify it.
            if log[name_len + 1] == GREATER {
                break;
            }

            if num_spaces >= MAX_NUM_SPACES || name_len > MAX_FIRST_LEN {
                return None;
            }

            // On a second space the previous parts were first + middle name,
            // which count together, so overwriting is correct either way.
            first_len = name_len;
            num_spaces += 1;
        }
        name_len += 1;
    }

    let has_space = num_spaces > 0;
    let family_len = if has_space { name_len - first_len - 1 } else { 0 };
    if !has_space {
        first_len = name_len;
    }

    // `name_len >= log.len()` means the ` >` sentinel cannot follow.
    if name_len < MIN_NAME_LEN
        || first_len > MAX_FIRST_LEN
        || family_len > MAX_FAMILY_LEN
        || name_len >= log.len()
    {
        return None;
    }

    let first = log[0];
    let last = log[name_len - 1];
    if is_special_char(first) || first == SPACE || is_special_char(last) {
        return None;
    }

    *rest = &log[name_len..];
    Some(&log[..name_len])
}

/// ASCII letters, digits, `-` and `'`; everything a name may contain besides
/// interior spaces.
fn is_allowed_char(c: u16) -> bool {
    matches!(c, 0x30..=0x39 | 0x41..=0x5A | 0x61..=0x7A) || is_special_char(c)
}

fn is_special_char(c: u16) -> bool {
    c == u16::from(b'-') || c == u16::from(b'\'')
}

fn find_subslice(haystack: &[u16], needle: &[u16]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(text: &str) -> Vec<u16> {
        text.encode_utf16().collect()
    }

    fn parse(text: &str) -> ParserResult {
        LogParser::new().parse(&utf16(text))
    }

    fn log(lines: &[&str]) -> String {
        let mut text = String::from("  Channel Name:    Local\n");
        for line in lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    fn record(name: &str, channel: &str, first: i64, last: i64, count: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(RECORD_SEP);
        bytes.extend_from_slice(channel.as_bytes());
        bytes.push(RECORD_SEP);
        bytes.extend_from_slice(&first.to_le_bytes());
        bytes.extend_from_slice(&last.to_le_bytes());
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.push(GROUP_SEP);
        bytes
    }

    #[test]
    fn test_single_valid_line() {
        let res = parse(&log(&["[ 2019.01.02 03:04:05 ] Jita Trader > hi"]));
        assert_eq!(res.report_count(), 1);
        assert_eq!(
            res.as_bytes(),
            record("Jita Trader", "Local", 1_546_398_245, 1_546_398_245, 1)
        );
    }

    #[test]
    fn test_record_key_covers_name_and_channel() {
        let res = parse(&log(&["[ 2019.01.02 03:04:05 ] Jita Trader > hi"]));
        let rec = res.records().next().expect("one record");
        assert_eq!(rec.key, b"Jita Trader\x1eLocal\x1e");
        assert_eq!(rec.bytes, &res.as_bytes()[..]);
    }

    #[test]
    fn test_aggregates_repeat_sightings() {
        let res = parse(&log(&[
            "[ 2019.01.02 03:04:05 ] Jita Trader > hi",
            "[ 2019.01.02 03:09:41 ] Jita Trader > still here",
        ]));
        assert_eq!(res.report_count(), 1);
        assert_eq!(
            res.as_bytes(),
            record("Jita Trader", "Local", 1_546_398_245, 1_546_398_581, 2)
        );
    }

    #[test]
    fn test_entries_emitted_in_name_order() {
        let res = parse(&log(&[
            "[ 2019.01.02 03:04:05 ] Zach > z first",
            "[ 2019.01.02 03:04:06 ] Anna > a second",
        ]));
        assert_eq!(res.report_count(), 2);

        let mut expected = record("Anna", "Local", 1_546_398_246, 1_546_398_246, 1);
        expected.extend_from_slice(&record("Zach", "Local", 1_546_398_245, 1_546_398_245, 1));
        assert_eq!(res.as_bytes(), expected);
    }

    #[test]
    fn test_deterministic_output() {
        let input = utf16(&log(&[
            "[ 2019.01.02 03:04:05 ] Mara Kell > one",
            "[ 2019.01.02 03:04:06 ] Bo > two",
            "damaged line",
            "[ 2019.01.02 03:04:07 ] Mara Kell > three",
        ]));
        let mut parser = LogParser::new();
        let first = parser.parse(&input);
        let second = parser.parse(&input);
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(first.report_count(), second.report_count());
    }

    #[test]
    fn test_eve_system_is_filtered() {
        let res = parse(&log(&["[ 2019.01.02 03:04:05 ] EVE System > MOTD"]));
        assert!(res.is_empty());
        assert!(res.as_bytes().is_empty());
    }

    #[test]
    fn test_missing_header_yields_empty_result() {
        assert!(parse("[ 2019.01.02 03:04:05 ] Jita Trader > hi\n").is_empty());
        assert!(parse("").is_empty());
        assert!(parse("Channel Name: Local").is_empty()); // no newline terminator
    }

    #[test]
    fn test_empty_channel_name_yields_empty_result() {
        // The space skip lands on the newline itself: empty channel name.
        let res = parse("Channel Name:   \n[ 2019.01.02 03:04:05 ] Jita Trader > hi\n");
        assert!(res.is_empty());
    }

    #[test]
    fn test_damaged_lines_are_skipped() {
        let res = parse(&log(&[
            "[ 2019.01.02 03:04:0X ] Broken Stamp > nope",
            "[ 2019.13.02 03:04:05 ] Bad Month > nope",
            "[ 2019.01.32 03:04:05 ] Bad Day > nope",
            "[ 2019.02.30 03:04:05 ] Bad Date > nope",
            "[ 2019.01.02 24:04:05 ] Bad Hour > nope",
            "[ 2019.01.02 03:60:05 ] Bad Minute > nope",
            "[ 2019.01.02 03:04:61 ] Bad Second > nope",
            "[2019.01.02 03:04:05] Tight Brackets > nope",
            "[ 2019.01.02 03:04:05 ] Jita Trader > hi",
        ]));
        assert_eq!(res.report_count(), 1);
        assert_eq!(
            res.as_bytes(),
            record("Jita Trader", "Local", 1_546_398_245, 1_546_398_245, 1)
        );
    }

    #[test]
    fn test_leap_second_rolls_over() {
        let res = parse(&log(&["[ 2016.12.31 23:59:60 ] Jita Trader > leap"]));
        assert_eq!(res.report_count(), 1);
        // 2017-01-01T00:00:00Z
        assert_eq!(
            res.as_bytes(),
            record("Jita Trader", "Local", 1_483_228_800, 1_483_228_800, 1)
        );
    }

    #[test]
    fn test_name_rules() {
        let reject = [
            "Ab",                                      // too short
            "-Bad Start",                              // leading special
            "'Bad Start",                              // leading quote
            "Bad End-",                                // trailing special
            "Bad  Spacing",                            // repeated space
            "Abcdefghijklmnopqrstuvwxyz Fam", // first part > 24
            "First Waytoolongfamilyname",     // family > 12
            "One Two Three Four",             // more than two spaces
            "Uni\u{00e7}ode Name",            // non-ASCII
        ];
        for name in reject {
            let res = parse(&log(&[&format!("[ 2019.01.02 03:04:05 ] {name} > hi")]));
            assert!(res.is_empty(), "name {name:?} should have been rejected");
        }

        let accept = ["Bob", "Jita Trader", "Gallente Mc'Duck", "A-a B'c Def"];
        for name in accept {
            let res = parse(&log(&[&format!("[ 2019.01.02 03:04:05 ] {name} > hi")]));
            assert_eq!(res.report_count(), 1, "name {name:?} should have parsed");
        }
    }

    #[test]
    fn test_name_requires_terminator() {
        // EOF right after the name: no ` >` can follow.
        let res = parse("Channel Name: Local\n[ 2019.01.02 03:04:05 ] Jita Trader");
        assert!(res.is_empty());
    }

    #[test]
    fn test_bracket_inside_message_does_not_derail() {
        let res = parse(&log(&[
            "[ 2019.01.02 03:04:05 ] Jita Trader > check [this] out",
            "[ 2019.01.02 03:04:06 ] Jita Trader > more",
        ]));
        assert_eq!(res.report_count(), 1);
        assert_eq!(
            res.as_bytes(),
            record("Jita Trader", "Local", 1_546_398_245, 1_546_398_246, 2)
        );
    }

    #[test]
    fn test_terminates_on_arbitrary_input() {
        // Pathological inputs must neither panic nor loop forever.
        let mut parser = LogParser::new();
        let inputs: Vec<Vec<u16>> = vec![
            utf16("Channel Name: Local\n[[[[[[[[["),
            utf16("Channel Name: Local\n[ 2019.01.02 03:04:05 ] "),
            utf16("Channel Name: Local\n["),
            vec![0u16; 4096],
            (0..4096u16).collect(),
            utf16(&"[ ".repeat(2048)),
            utf16(&format!("Channel Name: x\n{}", "[ 2019.01.02 03:04:05 ] A > b\n".repeat(64))),
        ];
        for input in inputs {
            let _ = parser.parse(&input);
        }
    }
}
